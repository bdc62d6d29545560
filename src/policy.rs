//! Stateless policy checks: CSR subject policy, per-cert-type validity
//! defaults, and referral-ticket JWT validation.
//!
//! Nothing here touches disk or the database — every method is a pure
//! function of its arguments (plus, for referral tickets, the injected JWKS
//! cache), the same shape `claw_auth::jwt::JwtManager` has relative to its
//! `JwtConfig`.

use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::crypto::verify_csr_self_signature;
use crate::error::{Error, Result};
use crate::jwks::{JwksCache, JwksKeysource};
use crate::types::{decode_pem, Audience, ReferralClaims};

/// Canonical issuer; `"reef-control"` is accepted as a legacy alias.
const ISSUER: &str = "coral-discovery";
const LEGACY_ISSUER: &str = "reef-control";
/// Canonical audience; `"colony-step-ca"` is accepted as a legacy alias.
const AUDIENCE: &str = "coral-colony";
const LEGACY_AUDIENCE: &str = "colony-step-ca";

/// Stateless policy rules, parameterized over the JWKS keysource used to
/// resolve referral-ticket signing keys.
pub struct PolicyEnforcer<K> {
    jwks: JwksCache<K>,
}

impl<K: JwksKeysource> PolicyEnforcer<K> {
    #[must_use]
    pub fn new(jwks_keysource: K) -> Self {
        Self {
            jwks: JwksCache::new(jwks_keysource),
        }
    }

    /// Verifies the CSR's self-signature and that its subject CN equals
    /// `agent.<agent_id>.<colony_id>` exactly.
    pub fn validate_agent_csr(&self, csr_pem: &str, agent_id: &str, colony_id: &str) -> Result<()> {
        verify_csr_self_signature(csr_pem)?;

        let (label, der) = decode_pem(csr_pem)?;
        if label != "CERTIFICATE REQUEST" {
            return Err(Error::InvalidCsr(format!(
                "expected a CERTIFICATE REQUEST PEM block, found {label}"
            )));
        }
        let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(&der)
            .map_err(|e| Error::InvalidCsr(format!("malformed CSR: {e}")))?;
        let subject = csr.certification_request_info.subject.to_string();
        let expected = format!("CN=agent.{agent_id}.{colony_id}");

        if subject != expected {
            return Err(Error::PolicyViolation(format!(
                "CSR subject '{subject}' does not match expected agent.{agent_id}.{colony_id}"
            )));
        }
        Ok(())
    }

    /// Rejects empty agent or colony ids.
    pub fn can_issue_agent_cert(&self, agent_id: &str, colony_id: &str) -> Result<()> {
        if agent_id.trim().is_empty() || colony_id.trim().is_empty() {
            return Err(Error::PolicyViolation(
                "agent_id and colony_id must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Accepts only `"server"` or `"agent"`.
    pub fn can_rotate_intermediate(&self, kind: &str) -> Result<()> {
        match kind {
            "server" | "agent" => Ok(()),
            other => Err(Error::PolicyViolation(format!(
                "cannot rotate unknown intermediate type '{other}'"
            ))),
        }
    }

    /// Default validity window per certificate type.
    #[must_use]
    pub fn certificate_validity(cert_type: &str) -> Duration {
        match cert_type {
            "agent" | "server" => Duration::days(90),
            "intermediate" => Duration::days(365),
            "root" | "policy-signing" => Duration::days(3650),
            _ => Duration::days(90),
        }
    }

    /// Validates a referral-ticket JWT end-to-end: algorithm, signature,
    /// expiry, issuer, audience. Returns the parsed claims on success.
    pub fn validate_referral_ticket(&self, token: &str) -> Result<ReferralClaims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::PolicyViolation(format!("malformed referral ticket header: {e}")))?;

        if header.alg != Algorithm::EdDSA {
            return Err(Error::PolicyViolation(format!(
                "referral ticket alg must be EdDSA, found {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::PolicyViolation("referral ticket header missing kid".into()))?;

        let public_key = self.jwks.get_key_by_kid(&kid)?;
        let decoding_key = DecodingKey::from_ed_der(&public_key);

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_required_spec_claims(&["exp"]);
        validation.set_issuer(&[ISSUER, LEGACY_ISSUER]);
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<ReferralClaims>(token, &decoding_key, &validation)
            .map_err(|e| Error::PolicyViolation(format!("referral ticket validation failed: {e}")))?;
        let claims = data.claims;

        if !claims.aud.contains(AUDIENCE) && !claims.aud.contains(LEGACY_AUDIENCE) {
            return Err(Error::PolicyViolation(format!(
                "referral ticket audience does not include {AUDIENCE} or {LEGACY_AUDIENCE}"
            )));
        }

        Ok(claims)
    }
}
