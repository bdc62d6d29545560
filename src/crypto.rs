//! Pure cryptographic operations over an already-loaded certificate
//! hierarchy. No filesystem or database access happens here; `CryptoOps`
//! only turns CSRs and templates into signed certificates.

use chrono::{Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{
    agent_spiffe_uri, decode_pem, server_spiffe_uri, Certificate, CertRequest, IntermediateKind,
    PrivateKey, Serial,
};

const ROOT_VALIDITY_DAYS: i64 = 3650;
const INTERMEDIATE_VALIDITY_DAYS: i64 = 365;
const POLICY_SIGNING_VALIDITY_DAYS: i64 = 3650;
/// Allows for clock skew between the issuing host and the verifying peer.
const NOT_BEFORE_SKEW_HOURS: i64 = 1;

/// In-memory signing operations over a loaded colony PKI hierarchy. Holds
/// the two intermediate key pairs and the policy-signing key pair; the Root
/// key is never held here (see `generate_intermediate_cert`, which takes it
/// as a borrowed argument for the duration of one call).
pub struct CryptoOps {
    root_cert: Certificate,
    server_intermediate_cert: Certificate,
    server_intermediate_key_pair: KeyPair,
    agent_intermediate_cert: Certificate,
    agent_intermediate_key_pair: KeyPair,
    policy_signing_cert: Certificate,
    policy_signing_key_pair: KeyPair,
}

impl CryptoOps {
    /// Builds `CryptoOps` from an already-issued hierarchy (either freshly
    /// generated by `CaManager::generate` or read back by
    /// `CaManager::load`).
    pub fn new(
        root_cert: Certificate,
        server_intermediate: (Certificate, &PrivateKey),
        agent_intermediate: (Certificate, &PrivateKey),
        policy_signing: (Certificate, &PrivateKey),
    ) -> Result<Self> {
        Ok(Self {
            root_cert,
            server_intermediate_cert: server_intermediate.0,
            server_intermediate_key_pair: server_intermediate.1.to_rcgen_key_pair()?,
            agent_intermediate_cert: agent_intermediate.0,
            agent_intermediate_key_pair: agent_intermediate.1.to_rcgen_key_pair()?,
            policy_signing_cert: policy_signing.0,
            policy_signing_key_pair: policy_signing.1.to_rcgen_key_pair()?,
        })
    }

    #[must_use]
    pub const fn root_certificate(&self) -> &Certificate {
        &self.root_cert
    }

    #[must_use]
    pub const fn server_intermediate_certificate(&self) -> &Certificate {
        &self.server_intermediate_cert
    }

    #[must_use]
    pub const fn agent_intermediate_certificate(&self) -> &Certificate {
        &self.agent_intermediate_cert
    }

    #[must_use]
    pub const fn policy_signing_certificate(&self) -> &Certificate {
        &self.policy_signing_cert
    }

    /// Returns `[intermediate, root]`, leaf-parent-first, for concatenation
    /// with a freshly issued agent leaf certificate.
    #[must_use]
    pub fn agent_cert_chain(&self) -> [Certificate; 2] {
        [self.agent_intermediate_cert.clone(), self.root_cert.clone()]
    }

    /// Returns `[intermediate, root]`, leaf-parent-first, for concatenation
    /// with a freshly issued server leaf certificate.
    #[must_use]
    pub fn server_cert_chain(&self) -> [Certificate; 2] {
        [
            self.server_intermediate_cert.clone(),
            self.root_cert.clone(),
        ]
    }

    /// Atomically swaps in a newly rotated server intermediate. The
    /// previous pair is dropped; archiving it on disk is
    /// `FilesystemStore`'s concern, not this one's.
    pub fn update_server_intermediate(&mut self, cert: Certificate, key: &PrivateKey) -> Result<()> {
        self.server_intermediate_key_pair = key.to_rcgen_key_pair()?;
        self.server_intermediate_cert = cert;
        info!("server intermediate swapped in-memory");
        Ok(())
    }

    /// Atomically swaps in a newly rotated agent intermediate.
    pub fn update_agent_intermediate(&mut self, cert: Certificate, key: &PrivateKey) -> Result<()> {
        self.agent_intermediate_key_pair = key.to_rcgen_key_pair()?;
        self.agent_intermediate_cert = cert;
        info!("agent intermediate swapped in-memory");
        Ok(())
    }

    /// Issues an agent leaf certificate from a CSR.
    ///
    /// Verifies the CSR's self-signature, copies its subject verbatim, and
    /// signs a template carrying `DigitalSignature|KeyEncipherment`,
    /// `ExtKeyUsage=ClientAuth`, and a single URI SAN
    /// `spiffe://coral/colony/<colony_id>/agent/<agent_id>`, under the held
    /// AgentIntermediate.
    pub fn generate_agent_cert(&self, request: &CertRequest) -> Result<(Certificate, Vec<u8>)> {
        verify_csr_self_signature(request.csr.as_str())?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(request.csr.as_str())
            .map_err(|e| Error::InvalidCsr(format!("failed to parse CSR: {e}")))?;

        let now = Utc::now();
        let serial = Serial::random_128();
        let uri = agent_spiffe_uri(&request.colony_id, &request.agent_id);

        csr_params.params.not_before = to_rcgen_time(now - Duration::hours(NOT_BEFORE_SKEW_HOURS))?;
        csr_params.params.not_after = to_rcgen_time(now + request.validity)?;
        csr_params.params.serial_number = Some((&serial).into());
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages =
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr_params.params.subject_alt_names = vec![SanType::URI(
            Ia5String::try_from(uri).map_err(|e| Error::Crypto(format!("invalid SPIFFE URI: {e}")))?,
        )];

        let issuer = issuer_certificate(
            &self.agent_intermediate_cert,
            &self.agent_intermediate_key_pair,
        )?;

        let cert = csr_params
            .signed_by(&issuer, &self.agent_intermediate_key_pair)
            .map_err(|e| Error::Crypto(format!("failed to sign agent certificate: {e}")))?;

        let der = cert.der().to_vec();
        let certificate = Certificate::from_der(der.clone())?;
        debug!(agent_id = %request.agent_id, colony_id = %request.colony_id, "agent certificate issued");
        Ok((certificate, der))
    }

    /// Issues a fresh server leaf certificate (keypair and all).
    ///
    /// Subject is `O=Coral, CN=colony.<colony_id>`, key usages are
    /// `DigitalSignature|KeyEncipherment` with `ExtKeyUsage=ServerAuth`, SANs
    /// are `dns_names` plus one URI SAN `spiffe://coral/colony/<colony_id>`,
    /// signed under the held ServerIntermediate.
    pub fn generate_server_cert(
        &self,
        colony_id: &str,
        dns_names: &[String],
        validity: Duration,
    ) -> Result<(Certificate, PrivateKey, Vec<u8>, Vec<u8>)> {
        let key_pair =
            KeyPair::generate().map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Coral");
        dn.push(DnType::CommonName, format!("colony.{colony_id}"));

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages =
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = Utc::now();
        params.not_before = to_rcgen_time(now - Duration::hours(NOT_BEFORE_SKEW_HOURS))?;
        params.not_after = to_rcgen_time(now + validity)?;
        params.serial_number = Some((&Serial::random_128()).into());

        let mut sans = dns_san_list(dns_names)?;
        sans.push(SanType::URI(
            Ia5String::try_from(server_spiffe_uri(colony_id))
                .map_err(|e| Error::Crypto(format!("invalid SPIFFE URI: {e}")))?,
        ));
        params.subject_alt_names = sans;

        let issuer = issuer_certificate(
            &self.server_intermediate_cert,
            &self.server_intermediate_key_pair,
        )?;

        let cert = params
            .signed_by(&key_pair, &issuer, &self.server_intermediate_key_pair)
            .map_err(|e| Error::Crypto(format!("failed to sign server certificate: {e}")))?;

        let cert_der = cert.der().to_vec();
        let key_der = key_pair.serialize_der();
        let certificate = Certificate::from_der(cert_der.clone())?;
        let private_key = PrivateKey::from_pkcs8_der(&key_der)?;
        let key_pem_der = private_key.der().to_vec();

        debug!(colony_id, "server certificate issued");
        Ok((certificate, private_key, cert_der, key_pem_der))
    }
}

/// Generates a fresh intermediate certificate (server or agent), signed
/// under the supplied Root key. Free function rather than a `CryptoOps`
/// method: it needs the Root key, which `CryptoOps` never holds resident.
pub fn generate_intermediate_cert(
    colony_id: &str,
    kind: IntermediateKind,
    root_cert: &Certificate,
    root_key: &PrivateKey,
    serial: Serial,
) -> Result<(Certificate, PrivateKey, Vec<u8>)> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

    let label = match kind {
        IntermediateKind::Server => "Server",
        IntermediateKind::Agent => "Agent",
    };

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Coral");
    dn.push(
        DnType::CommonName,
        format!("Coral {label} Intermediate CA - {colony_id}"),
    );

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = Utc::now();
    params.not_before = to_rcgen_time(now - Duration::hours(NOT_BEFORE_SKEW_HOURS))?;
    params.not_after = to_rcgen_time(now + Duration::days(INTERMEDIATE_VALIDITY_DAYS))?;
    params.serial_number = Some((&serial).into());

    let root_key_pair = root_key.to_rcgen_key_pair()?;
    let issuer = issuer_certificate(root_cert, &root_key_pair)?;

    let cert = params
        .signed_by(&key_pair, &issuer, &root_key_pair)
        .map_err(|e| Error::Crypto(format!("failed to sign {kind} intermediate: {e}")))?;

    let der = cert.der().to_vec();
    let certificate = Certificate::from_der(der.clone())?;
    let private_key = PrivateKey::from_pkcs8_der(&key_pair.serialize_der())?;

    info!(colony_id, %kind, "intermediate certificate generated");
    Ok((certificate, private_key, der))
}

/// Generates the self-signed Root certificate for a new colony.
pub fn generate_root_certificate(colony_id: &str, serial: Serial) -> Result<(Certificate, PrivateKey)> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Coral");
    dn.push(DnType::CommonName, format!("Coral Root CA - {colony_id}"));

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = Utc::now();
    params.not_before = to_rcgen_time(now - Duration::hours(NOT_BEFORE_SKEW_HOURS))?;
    params.not_after = to_rcgen_time(now + Duration::days(ROOT_VALIDITY_DAYS))?;
    params.serial_number = Some((&serial).into());

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Crypto(format!("failed to self-sign root certificate: {e}")))?;

    let der = cert.der().to_vec();
    let certificate = Certificate::from_der(der)?;
    let private_key = PrivateKey::from_pkcs8_der(&key_pair.serialize_der())?;

    info!(colony_id, "root certificate generated");
    Ok((certificate, private_key))
}

/// Generates the once-only PolicySigning certificate, signed under Root.
pub fn generate_policy_signing_cert(
    colony_id: &str,
    root_cert: &Certificate,
    root_key: &PrivateKey,
    serial: Serial,
) -> Result<(Certificate, PrivateKey)> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Coral");
    dn.push(DnType::CommonName, format!("Coral Policy Signing - {colony_id}"));

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    let now = Utc::now();
    params.not_before = to_rcgen_time(now - Duration::hours(NOT_BEFORE_SKEW_HOURS))?;
    params.not_after = to_rcgen_time(now + Duration::days(POLICY_SIGNING_VALIDITY_DAYS))?;
    params.serial_number = Some((&serial).into());

    let root_key_pair = root_key.to_rcgen_key_pair()?;
    let issuer = issuer_certificate(root_cert, &root_key_pair)?;

    let cert = params
        .signed_by(&key_pair, &issuer, &root_key_pair)
        .map_err(|e| Error::Crypto(format!("failed to sign policy-signing cert: {e}")))?;

    let der = cert.der().to_vec();
    let certificate = Certificate::from_der(der)?;
    let private_key = PrivateKey::from_pkcs8_der(&key_pair.serialize_der())?;

    info!(colony_id, "policy-signing certificate generated");
    Ok((certificate, private_key))
}

/// Rebuilds an `rcgen::Certificate` usable as an issuer for `signed_by`,
/// from a stored certificate and its matching key pair. `rcgen` doesn't let
/// us persist a `Certificate` across calls, so every signing operation
/// rebuilds the issuer from its own params, the same way a self-signed CA
/// is rebuilt fresh for each call.
fn issuer_certificate(cert: &Certificate, key_pair: &KeyPair) -> Result<rcgen::Certificate> {
    let params = CertificateParams::from_ca_cert_pem(&cert.pem())
        .map_err(|e| Error::Crypto(format!("failed to load issuer params: {e}")))?;
    params
        .self_signed(key_pair)
        .map_err(|e| Error::Crypto(format!("failed to rebuild issuer certificate: {e}")))
}

/// Verifies a PEM CSR's self-signature without inspecting anything else
/// about it; subject-policy checks belong to `PolicyEnforcer`.
pub(crate) fn verify_csr_self_signature(csr_pem: &str) -> Result<()> {
    let (label, der) = decode_pem(csr_pem)?;
    if label != "CERTIFICATE REQUEST" {
        return Err(Error::InvalidCsr(format!(
            "expected a CERTIFICATE REQUEST PEM block, found {label}"
        )));
    }
    let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::InvalidCsr(format!("malformed CSR: {e}")))?;
    csr.verify_signature()
        .map_err(|e| Error::InvalidCsr(format!("CSR self-signature check failed: {e}")))
}

fn dns_san_list(dns_names: &[String]) -> Result<Vec<SanType>> {
    dns_names
        .iter()
        .map(|dns| {
            Ia5String::try_from(dns.clone())
                .map(SanType::DnsName)
                .map_err(|e| Error::Crypto(format!("invalid DNS name '{dns}': {e}")))
        })
        .collect()
}

fn to_rcgen_time(dt: chrono::DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Crypto(format!("invalid timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CsrPem;

    fn make_hierarchy(colony_id: &str) -> (Certificate, PrivateKey, CryptoOps) {
        let (root_cert, root_key) = generate_root_certificate(colony_id, Serial::fixed(1)).unwrap();
        let (server_cert, server_key, _) = generate_intermediate_cert(
            colony_id,
            IntermediateKind::Server,
            &root_cert,
            &root_key,
            Serial::fixed(2),
        )
        .unwrap();
        let (agent_cert, agent_key, _) = generate_intermediate_cert(
            colony_id,
            IntermediateKind::Agent,
            &root_cert,
            &root_key,
            Serial::fixed(3),
        )
        .unwrap();
        let (policy_cert, policy_key) =
            generate_policy_signing_cert(colony_id, &root_cert, &root_key, Serial::fixed(4)).unwrap();

        let ops = CryptoOps::new(
            root_cert.clone(),
            (server_cert, &server_key),
            (agent_cert, &agent_key),
            (policy_cert, &policy_key),
        )
        .unwrap();

        (root_cert, root_key, ops)
    }

    fn agent_csr_pem(cn: &str) -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key_pair).unwrap();
        csr.pem().unwrap()
    }

    #[test]
    fn root_certificate_has_expected_subject() {
        let (root_cert, _, _) = make_hierarchy("colony-a");
        assert_eq!(root_cert.subject(), "O=Coral, CN=Coral Root CA - colony-a");
        assert_eq!(root_cert.issuer(), root_cert.subject());
    }

    #[test]
    fn generate_server_cert_has_spiffe_uri_and_dns_sans() {
        let (_, _, ops) = make_hierarchy("colony-a");
        let (cert, key, _, _) = ops
            .generate_server_cert("colony-a", &["node.colony-a.local".to_string()], Duration::days(90))
            .unwrap();

        assert_eq!(
            cert.uri_sans(),
            &["spiffe://coral/colony/colony-a".to_string()]
        );
        assert_eq!(cert.dns_names(), &["node.colony-a.local".to_string()]);
        assert!(!key.der().is_empty());
        assert_eq!((cert.not_after() - cert.not_before()).num_days(), 90);
    }

    #[test]
    fn generate_agent_cert_embeds_agent_spiffe_uri() {
        let (_, _, ops) = make_hierarchy("colony-a");
        let csr_pem = agent_csr_pem("agent.agent-7.colony-a");
        let request = CertRequest {
            csr: CsrPem::new(csr_pem),
            colony_id: "colony-a".to_string(),
            agent_id: "agent-7".to_string(),
            validity: Duration::days(90),
        };

        let (cert, _der) = ops.generate_agent_cert(&request).unwrap();
        assert_eq!(
            cert.uri_sans(),
            &["spiffe://coral/colony/colony-a/agent/agent-7".to_string()]
        );
        assert_eq!(cert.subject(), "CN=agent.agent-7.colony-a");
    }

    #[test]
    fn intermediate_cert_has_explicit_path_len_zero() {
        let (root_cert, root_key, _) = make_hierarchy("colony-a");
        let (cert, _, _) = generate_intermediate_cert(
            "colony-a",
            IntermediateKind::Agent,
            &root_cert,
            &root_key,
            Serial::random_128(),
        )
        .unwrap();
        assert_eq!(cert.issuer(), root_cert.subject());
    }

    #[test]
    fn update_agent_intermediate_swaps_signing_key() {
        let (root_cert, root_key, mut ops) = make_hierarchy("colony-a");
        let old_serial = ops.agent_intermediate_certificate().serial().clone();

        let (new_cert, new_key, _) = generate_intermediate_cert(
            "colony-a",
            IntermediateKind::Agent,
            &root_cert,
            &root_key,
            Serial::random_128(),
        )
        .unwrap();
        let new_serial = new_cert.serial().clone();
        ops.update_agent_intermediate(new_cert, &new_key).unwrap();

        assert_ne!(old_serial, new_serial);
        assert_eq!(ops.agent_intermediate_certificate().serial(), &new_serial);
    }
}
