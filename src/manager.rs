//! `CaManager`: the lifecycle façade a colony runtime links against.
//!
//! Composes `FilesystemStore`, `CryptoOps`, `CertificateLedger`, `PskVault`,
//! and `PolicyEnforcer` with no back-references between them, the same flat
//! composition `claw-pki`'s top-level `CertificateAuthority` uses over its
//! own `CertStore`.

use std::sync::RwLock;

use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::crypto::{
    generate_intermediate_cert, generate_policy_signing_cert, generate_root_certificate, CryptoOps,
};
use crate::error::{Error, Result};
use crate::fs_store::FilesystemStore;
use crate::jwks::JwksKeysource;
use crate::ledger::CertificateLedger;
use crate::policy::PolicyEnforcer;
use crate::psk::{self, PskVault};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{
    CertRequest, CertificateFilter, CertificateStatus, CsrPem, IntermediateKind,
    IssuedCertificateMeta, ReferralClaims, Serial,
};

/// Configuration a colony runtime supplies to open (or create) its CA.
pub struct CaManagerConfig<K> {
    pub colony_id: String,
    pub ca_dir: std::path::PathBuf,
    pub jwks_keysource: K,
    pub kms_key_id: Option<String>,
}

/// A snapshot of each held certificate's location and expiry, plus the
/// colony's identity, for diagnostics and health endpoints.
#[derive(Debug, Clone)]
pub struct CaStatus {
    pub colony_id: String,
    pub spiffe_id: String,
    pub root_fingerprint: String,
    pub root_expires_at: chrono::DateTime<Utc>,
    pub server_intermediate_expires_at: chrono::DateTime<Utc>,
    pub agent_intermediate_expires_at: chrono::DateTime<Utc>,
    pub policy_signing_expires_at: chrono::DateTime<Utc>,
}

/// The lifecycle façade. Holds the five sub-components as independent
/// owned values; `CryptoOps` sits behind an `RwLock` since issuance calls
/// read it concurrently while intermediate rotation needs exclusive access.
pub struct CaManager<K> {
    colony_id: String,
    fs_store: FilesystemStore,
    crypto: RwLock<CryptoOps>,
    ledger: CertificateLedger,
    psk_vault: PskVault,
    policy: PolicyEnforcer<K>,
    retry_policy: RetryPolicy,
}

impl<K: JwksKeysource> CaManager<K> {
    /// Opens an existing colony's CA, or bootstraps a new one if none
    /// exists on disk yet. Does not import the bootstrap PSK from its
    /// init-time file; call `initialize` explicitly for that, after the
    /// surrounding runtime has finished its own DB migrations.
    pub fn new(db: Connection, cfg: CaManagerConfig<K>) -> Result<Self> {
        let fs_store = FilesystemStore::new(cfg.ca_dir);
        fs_store.ensure_ca_directory()?;

        let ledger_conn = reopen(&db)?;
        let psk_conn = db;

        let crypto = if fs_store.ca_exists() {
            load_crypto_ops(&fs_store)?
        } else {
            generate_crypto_ops(&fs_store, &cfg.colony_id)?
        };

        Ok(Self {
            colony_id: cfg.colony_id,
            fs_store,
            crypto: RwLock::new(crypto),
            ledger: CertificateLedger::new(ledger_conn)?,
            psk_vault: PskVault::new(psk_conn)?,
            policy: PolicyEnforcer::new(cfg.jwks_keysource),
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Generates and saves the initial bootstrap PSK. Called once, at
    /// colony-bootstrap time, after `new()`.
    pub fn initialize(&self) -> Result<String> {
        let root_key = self.fs_store.load_key("root-ca")?;
        let new_psk = psk::generate();
        self.psk_vault.store(&self.colony_id, &new_psk, &root_key)?;
        psk::save_to_file(&self.fs_store, &new_psk, &root_key)?;
        info!(colony_id = %self.colony_id, "initialized bootstrap PSK");
        Ok(new_psk)
    }

    /// Issues an agent leaf certificate from a CSR, after policy checks,
    /// and persists the issued metadata.
    pub async fn issue_agent_cert(
        &self,
        agent_id: &str,
        colony_id: &str,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, String, chrono::DateTime<Utc>)> {
        self.policy.can_issue_agent_cert(agent_id, colony_id)?;
        self.policy
            .validate_agent_csr(csr_pem, agent_id, colony_id)?;

        let validity = crate::policy::PolicyEnforcer::<K>::certificate_validity("agent");
        let request = CertRequest {
            csr: CsrPem::new(csr_pem.to_string()),
            colony_id: colony_id.to_string(),
            agent_id: agent_id.to_string(),
            validity,
        };

        // One guard held across signing and chain construction: a
        // `rotate_intermediate` write landing between two separate reads
        // could sign the leaf under the old agent intermediate but build
        // the chain from the new one, yielding a chain that doesn't verify
        // the leaf it's paired with.
        let (cert, chain_pem) = {
            let crypto = self.read_crypto()?;
            let (cert, _der) = crypto.generate_agent_cert(&request)?;
            let [intermediate, root] = crypto.agent_cert_chain();
            let chain_pem = format!("{}{}", intermediate.pem(), root.pem());
            (cert, chain_pem)
        };

        let meta = IssuedCertificateMeta {
            serial: cert.serial().clone(),
            agent_id: Some(agent_id.to_string()),
            colony_id: colony_id.to_string(),
            certificate_pem: cert.pem(),
            issued_at: Utc::now(),
            expires_at: cert.not_after(),
            status: CertificateStatus::Active,
            revoked_at: None,
            revocation_reason: None,
        };

        with_retry(&self.retry_policy, cancel, || async {
            self.ledger.store_certificate(&meta)
        })
        .await?;

        Ok((cert.pem(), chain_pem, cert.not_after()))
    }

    /// Issues a fresh server leaf certificate (keypair and all); not
    /// persisted to the ledger since server certs aren't tracked there.
    pub fn issue_server_cert(&self, dns_names: &[String]) -> Result<(String, String)> {
        let validity = crate::policy::PolicyEnforcer::<K>::certificate_validity("server");
        let crypto = self.read_crypto()?;
        let (cert, key, _cert_der, _key_der) =
            crypto.generate_server_cert(&self.colony_id, dns_names, validity)?;
        Ok((cert.pem(), key.pem()))
    }

    /// Revokes a previously issued certificate.
    pub async fn revoke_cert(
        &self,
        serial: &Serial,
        reason: &str,
        revoked_by: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_retry(&self.retry_policy, cancel, || async {
            self.ledger.revoke_certificate(serial, reason, revoked_by)
        })
        .await
    }

    /// Lists certificates in the ledger matching a filter.
    pub fn list_certificates(&self, filter: &CertificateFilter) -> Result<Vec<IssuedCertificateMeta>> {
        self.ledger.list_certificates(filter)
    }

    /// Rotates the named intermediate: archives the current files, signs
    /// and saves a new pair, and swaps it into the held `CryptoOps`. The
    /// Root private key is loaded only for the duration of this call and
    /// explicitly wiped before returning, even though its `ZeroizeOnDrop`
    /// derive would also wipe it on scope exit.
    pub fn rotate_intermediate(&self, kind: &str) -> Result<()> {
        self.policy.can_rotate_intermediate(kind)?;
        let intermediate_kind = IntermediateKind::parse(kind)?;
        let name = match intermediate_kind {
            IntermediateKind::Server => "server-intermediate",
            IntermediateKind::Agent => "agent-intermediate",
        };

        let mut root_key = self.fs_store.load_key("root-ca")?;
        let root_cert = self.fs_store.load_cert("root-ca")?;

        let (new_cert, new_key, _der) = generate_intermediate_cert(
            &self.colony_id,
            intermediate_kind,
            &root_cert,
            &root_key,
            Serial::random_128(),
        )?;

        let mut crypto = self.write_crypto()?;
        self.fs_store.archive_cert_and_key(name)?;
        self.fs_store.save_cert_and_key(name, &new_cert, &new_key)?;
        match intermediate_kind {
            IntermediateKind::Server => crypto.update_server_intermediate(new_cert, &new_key)?,
            IntermediateKind::Agent => crypto.update_agent_intermediate(new_cert, &new_key)?,
        }
        drop(crypto);

        zeroize::Zeroize::zeroize(&mut root_key);
        self.fs_store.fix_ownership()?;

        info!(colony_id = %self.colony_id, %kind, "rotated intermediate certificate");
        Ok(())
    }

    /// Hex SHA-256 of the Root certificate's DER bytes.
    pub fn ca_fingerprint(&self) -> Result<String> {
        let crypto = self.read_crypto()?;
        let mut hasher = Sha256::new();
        hasher.update(crypto.root_certificate().der());
        Ok(crate::types::encode_hex(&hasher.finalize()))
    }

    /// Snapshot of certificate expiries, the colony's SPIFFE ID, and the
    /// Root fingerprint.
    pub fn status(&self) -> Result<CaStatus> {
        let crypto = self.read_crypto()?;
        Ok(CaStatus {
            colony_id: self.colony_id.clone(),
            spiffe_id: crate::types::server_spiffe_uri(&self.colony_id),
            root_fingerprint: self.ca_fingerprint()?,
            root_expires_at: crypto.root_certificate().not_after(),
            server_intermediate_expires_at: crypto.server_intermediate_certificate().not_after(),
            agent_intermediate_expires_at: crypto.agent_intermediate_certificate().not_after(),
            policy_signing_expires_at: crypto.policy_signing_certificate().not_after(),
        })
    }

    /// Validates a candidate bootstrap PSK against the vault.
    pub fn validate_psk(&self, candidate: &str) -> Result<()> {
        let root_key = self.fs_store.load_key("root-ca")?;
        self.psk_vault.validate(candidate, &root_key)
    }

    /// Rotates the active bootstrap PSK, returning the new value.
    pub fn rotate_psk(&self, grace_period: chrono::Duration) -> Result<String> {
        let root_key = self.fs_store.load_key("root-ca")?;
        self.psk_vault
            .rotate(&self.fs_store, &root_key, &self.colony_id, grace_period)
    }

    /// Returns the currently active bootstrap PSK.
    pub fn get_active_psk(&self) -> Result<String> {
        let root_key = self.fs_store.load_key("root-ca")?;
        self.psk_vault.get_active(&root_key)
    }

    /// On startup, imports the init-time PSK file into the vault if no
    /// active or grace-period row already exists. Deferred to an explicit
    /// call since it must run after the surrounding runtime's own DB
    /// migrations complete.
    pub fn import_psk_from_file_if_needed(&self) -> Result<()> {
        let root_key = self.fs_store.load_key("root-ca")?;
        self.psk_vault
            .import_from_file_if_needed(&self.fs_store, &root_key, &self.colony_id)
    }

    /// Validates a referral-ticket JWT.
    pub fn validate_referral_ticket(&self, token: &str) -> Result<ReferralClaims> {
        self.policy.validate_referral_ticket(token)
    }

    fn read_crypto(&self) -> Result<std::sync::RwLockReadGuard<'_, CryptoOps>> {
        self.crypto
            .read()
            .map_err(|e| Error::Storage(format!("CryptoOps lock poisoned: {e}")))
    }

    fn write_crypto(&self) -> Result<std::sync::RwLockWriteGuard<'_, CryptoOps>> {
        self.crypto
            .write()
            .map_err(|e| Error::Storage(format!("CryptoOps lock poisoned: {e}")))
    }
}

/// Generates the full hierarchy (Root → ServerIntermediate →
/// AgentIntermediate → PolicySigning, each Root-signed), persists every
/// pair, and builds the in-memory `CryptoOps`.
fn generate_crypto_ops(fs_store: &FilesystemStore, colony_id: &str) -> Result<CryptoOps> {
    let (root_cert, root_key) = generate_root_certificate(colony_id, Serial::fixed(1))?;
    fs_store.save_cert_and_key("root-ca", &root_cert, &root_key)?;

    let (server_cert, server_key, _) = generate_intermediate_cert(
        colony_id,
        IntermediateKind::Server,
        &root_cert,
        &root_key,
        Serial::fixed(2),
    )?;
    fs_store.save_cert_and_key("server-intermediate", &server_cert, &server_key)?;

    let (agent_cert, agent_key, _) = generate_intermediate_cert(
        colony_id,
        IntermediateKind::Agent,
        &root_cert,
        &root_key,
        Serial::fixed(3),
    )?;
    fs_store.save_cert_and_key("agent-intermediate", &agent_cert, &agent_key)?;

    let (policy_cert, policy_key) =
        generate_policy_signing_cert(colony_id, &root_cert, &root_key, Serial::fixed(4))?;
    fs_store.save_cert_and_key("policy-signing", &policy_cert, &policy_key)?;

    fs_store.fix_ownership()?;

    info!(colony_id, "generated new colony PKI hierarchy");
    CryptoOps::new(
        root_cert,
        (server_cert, &server_key),
        (agent_cert, &agent_key),
        (policy_cert, &policy_key),
    )
}

/// Reads an already-bootstrapped hierarchy back from disk.
fn load_crypto_ops(fs_store: &FilesystemStore) -> Result<CryptoOps> {
    let root_cert = fs_store.load_cert("root-ca")?;
    let server_cert = fs_store.load_cert("server-intermediate")?;
    let server_key = fs_store.load_key("server-intermediate")?;
    let agent_cert = fs_store.load_cert("agent-intermediate")?;
    let agent_key = fs_store.load_key("agent-intermediate")?;
    let policy_cert = fs_store.load_cert("policy-signing")?;
    let policy_key = fs_store.load_key("policy-signing")?;

    CryptoOps::new(
        root_cert,
        (server_cert, &server_key),
        (agent_cert, &agent_key),
        (policy_cert, &policy_key),
    )
}

/// Opens a second connection to the same on-disk database file, since
/// `rusqlite::Connection` isn't `Clone` and the ledger and the PSK vault
/// each need to own their own connection behind independent mutexes.
/// In-memory-only connections (`":memory:"`, tests) can't be reopened this
/// way and are rejected up front.
fn reopen(conn: &Connection) -> Result<Connection> {
    let path = conn
        .path()
        .ok_or_else(|| Error::InvalidInput("CaManager requires a file-backed database connection".into()))?;
    if path == ":memory:" {
        return Err(Error::InvalidInput(
            "CaManager requires a file-backed database connection".into(),
        ));
    }
    Connection::open(path).map_err(Error::from)
}
