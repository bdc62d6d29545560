//! X.509 path validation over an already-parsed certificate chain.
//!
//! `CryptoOps` signs leaf certificates but never re-verifies them against
//! their issuer; this module is the independent check used by tests (and
//! available to callers that want to confirm a chain before shipping it
//! over the wire) that a chain produced by this crate actually verifies
//! under standard X.509 path validation, not just string-equal
//! subject/issuer fields.

use tracing::debug;
use x509_parser::prelude::X509Certificate;

use crate::error::{Error, Result};
use crate::types::Certificate;

/// Validates a certificate chain ordered leaf-first, root-last: each
/// certificate's issuer must string-match the next certificate's subject,
/// each signature must verify under the next certificate's public key, and
/// the root must be self-signed. Does not check expiry; callers that care
/// about the validity window check `not_before`/`not_after` separately.
pub fn verify_chain(chain: &[Certificate]) -> Result<()> {
    if chain.is_empty() {
        return Err(Error::Parse("empty certificate chain".into()));
    }

    for pair in chain.windows(2) {
        let [cert, issuer] = pair else { unreachable!() };
        if cert.issuer() != issuer.subject() {
            return Err(Error::PolicyViolation(format!(
                "issuer '{}' does not match next certificate's subject '{}'",
                cert.issuer(),
                issuer.subject()
            )));
        }
        verify_signature(cert, issuer)?;
        debug!(subject = cert.subject(), "chain link verified");
    }

    let root = &chain[chain.len() - 1];
    if root.issuer() != root.subject() {
        return Err(Error::PolicyViolation(
            "root certificate in chain is not self-signed".into(),
        ));
    }
    verify_signature(root, root)
}

fn verify_signature(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let (_, parsed_cert) = X509Certificate::from_der(cert.der())
        .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;
    let (_, parsed_issuer) = X509Certificate::from_der(issuer.der())
        .map_err(|e| Error::Parse(format!("failed to parse issuer certificate: {e}")))?;

    parsed_cert
        .verify_signature(Some(parsed_issuer.public_key()))
        .map_err(|e| {
            Error::Crypto(format!(
                "signature verification failed for '{}': {e:?}",
                cert.subject()
            ))
        })
}
