//! Bootstrap PSK lifecycle: generation, envelope encryption, persistence,
//! rotation, and constant-time validation.
//!
//! The encryption key is never stored; it is re-derived from the Root CA
//! private key via HKDF-SHA256 every time it's needed, the same
//! derive-on-demand shape `claw-secrets::encryption::SecretKey::derive_for_secret`
//! uses for its own per-secret keys, substituting HKDF-SHA256 for BLAKE3
//! since the PSK vault's derivation construction is pinned exactly.

use std::sync::Mutex;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::error::{Error, Result};
use crate::fs_store::FilesystemStore;
use crate::types::{BootstrapPskRecord, PrivateKey, PskStatus};

const PSK_PREFIX: &str = "coral-psk:";
const PSK_SECRET_BYTES: usize = 32;
const PSK_STRING_LEN: usize = PSK_PREFIX.len() + PSK_SECRET_BYTES * 2;
const HKDF_INFO: &[u8] = b"coral-psk-encryption";
const NONCE_LEN: usize = 12;
const PSK_FILE_NAME: &str = "bootstrap-psk.enc";

/// Generates a new PSK: 32 random bytes rendered as
/// `"coral-psk:" || hex(32 bytes)`.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; PSK_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{PSK_PREFIX}{}", crate::types::encode_hex(&bytes))
}

/// Rejects anything that isn't `"coral-psk:"` followed by exactly 64 lowercase
/// hex characters.
pub fn validate_format(candidate: &str) -> Result<()> {
    if candidate.len() != PSK_STRING_LEN || !candidate.starts_with(PSK_PREFIX) {
        return Err(Error::InvalidPsk);
    }
    let hex_part = &candidate[PSK_PREFIX.len()..];
    if !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidPsk);
    }
    Ok(())
}

/// Derives the 32-byte AES-256 encryption key from the Root CA's ECDSA
/// private scalar: HKDF-SHA256, empty salt, `info = "coral-psk-encryption"`.
/// Deterministic — the same Root key always yields the same encryption key.
pub fn derive_key(root_key: &PrivateKey) -> Result<[u8; 32]> {
    let scalar = root_key.scalar()?;
    let hkdf = Hkdf::<Sha256>::new(None, &scalar);
    let mut out = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut out)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(out)
}

/// AES-256-GCM encrypts `plaintext` under `key` with a fresh random 12-byte
/// nonce. No AAD. Returns `(ciphertext_with_tag, nonce)`.
fn encrypt(key: &[u8; 32], plaintext: &str) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to init AES-256-GCM: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| Error::Crypto(format!("PSK encryption failed: {e}")))?;
    Ok((ciphertext, nonce_bytes))
}

/// Decrypts a PSK ciphertext produced by [`encrypt`]. Any AEAD failure
/// (wrong key, corruption, tampering) surfaces as `CryptoError`; callers that
/// need to treat corrupted rows as silently-skippable (see `validate`) check
/// for that case explicitly.
fn decrypt(key: &[u8; 32], ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to init AES-256-GCM: {e}")))?;
    let nonce = Nonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Crypto(format!("PSK decryption failed: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| Error::Crypto(format!("decrypted PSK not UTF-8: {e}")))
}

/// The init-time on-disk PSK file: `{ "encrypted_psk": base64, "nonce": base64 }`.
#[derive(Serialize, Deserialize)]
struct PskFile {
    encrypted_psk: String,
    nonce: String,
}

/// Writes the encrypted PSK file to `<ca_dir>/bootstrap-psk.enc` at mode
/// `0600`, used once at colony-bootstrap time.
pub fn save_to_file(fs_store: &FilesystemStore, psk: &str, root_key: &PrivateKey) -> Result<()> {
    use base64::Engine as _;
    let key = derive_key(root_key)?;
    let (ciphertext, nonce) = encrypt(&key, psk)?;
    let file = PskFile {
        encrypted_psk: base64::engine::general_purpose::STANDARD.encode(&ciphertext),
        nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
    };
    let json = serde_json::to_vec(&file)
        .map_err(|e| Error::Io(format!("failed to serialize PSK file: {e}")))?;
    fs_store.write_secret_file(PSK_FILE_NAME, &json)
}

/// Reads back the init-time PSK file and decrypts it.
pub fn load_from_file(fs_store: &FilesystemStore, root_key: &PrivateKey) -> Result<String> {
    use base64::Engine as _;
    let bytes = fs_store.read_secret_file(PSK_FILE_NAME)?;
    let file: PskFile = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Parse(format!("malformed PSK file: {e}")))?;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(&file.encrypted_psk)
        .map_err(|e| Error::Parse(format!("invalid base64 in PSK file: {e}")))?;
    let nonce_bytes = base64::engine::general_purpose::STANDARD
        .decode(&file.nonce)
        .map_err(|e| Error::Parse(format!("invalid base64 nonce in PSK file: {e}")))?;
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| Error::Parse("PSK file nonce is not 12 bytes".into()))?;
    let key = derive_key(root_key)?;
    decrypt(&key, &ciphertext, &nonce)
}

/// Runtime store for the `bootstrap_psks` table: every row the vault has
/// ever issued, keyed by a wall-clock-nanosecond id.
pub struct PskVault {
    conn: Mutex<Connection>,
}

impl PskVault {
    /// Opens (or creates) the `bootstrap_psks` table against an already-open
    /// connection.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bootstrap_psks (
                id               TEXT PRIMARY KEY,
                colony_id        TEXT NOT NULL,
                encrypted_psk    BLOB NOT NULL,
                encryption_nonce BLOB NOT NULL,
                status           TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                grace_expires_at TEXT,
                revoked_at       TEXT
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// On colony startup: if no row has status `active` or `grace`, decrypt
    /// the init-time file and insert one `active` row. Idempotent.
    pub fn import_from_file_if_needed(
        &self,
        fs_store: &FilesystemStore,
        root_key: &PrivateKey,
        colony_id: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM bootstrap_psks WHERE status IN ('active', 'grace') LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(());
        }
        drop(conn);

        let psk = match load_from_file(fs_store, root_key) {
            Ok(psk) => psk,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.insert_active_row(colony_id, &psk, root_key)?;
        info!(colony_id, "imported bootstrap PSK from init-time file");
        Ok(())
    }

    /// Encrypts and inserts a new `active` row. The id is the current
    /// wall-clock time in nanoseconds rendered as text; a primary-key
    /// collision (two calls landing in the same nanosecond, on a coarse
    /// clock) surfaces as `Duplicate` rather than silently overwriting.
    pub fn store(&self, colony_id: &str, psk: &str, root_key: &PrivateKey) -> Result<()> {
        validate_format(psk)?;
        self.insert_active_row(colony_id, psk, root_key)
    }

    fn insert_active_row(&self, colony_id: &str, psk: &str, root_key: &PrivateKey) -> Result<()> {
        let key = derive_key(root_key)?;
        let (ciphertext, nonce) = encrypt(&key, psk)?;
        let id = nanosecond_id();
        let now = Utc::now();

        let conn = self.lock()?;
        let rows = conn
            .execute(
                "INSERT INTO bootstrap_psks
                    (id, colony_id, encrypted_psk, encryption_nonce, status, created_at,
                     grace_expires_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, NULL, NULL)",
                params![id, colony_id, ciphertext, nonce.as_slice(), now.to_rfc3339()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Duplicate(format!("PSK id {id} already present"))
                } else {
                    Error::from(e)
                }
            })?;
        debug_assert_eq!(rows, 1);
        Ok(())
    }

    /// Validates a candidate PSK against every currently-accepted row
    /// (`active` or unexpired `grace`). Performs lazy cleanup first
    /// (`grace` rows past their deadline become `revoked`). Comparison is
    /// constant-time; a corrupted row is skipped rather than failing the
    /// whole call.
    pub fn validate(&self, candidate: &str, root_key: &PrivateKey) -> Result<()> {
        if validate_format(candidate).is_err() {
            return Err(Error::InvalidPsk);
        }

        let key = derive_key(root_key)?;
        let rows = {
            let conn = self.lock()?;
            let now = Utc::now().to_rfc3339();

            conn.execute(
                "UPDATE bootstrap_psks
                 SET status = 'revoked', revoked_at = ?1
                 WHERE status = 'grace' AND grace_expires_at IS NOT NULL AND grace_expires_at < ?1",
                params![now],
            )?;

            let mut stmt = conn.prepare(
                "SELECT encrypted_psk, encryption_nonce FROM bootstrap_psks
                 WHERE status IN ('active', 'grace')
                   AND (grace_expires_at IS NULL OR grace_expires_at > ?1)",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                let ciphertext: Vec<u8> = row.get(0)?;
                let nonce: Vec<u8> = row.get(1)?;
                Ok((ciphertext, nonce))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut matched = false;
        for (ciphertext, nonce_bytes) in rows {
            let Ok(nonce): std::result::Result<[u8; NONCE_LEN], _> = nonce_bytes.try_into() else {
                continue;
            };
            let Ok(plaintext) = decrypt(&key, &ciphertext, &nonce) else {
                continue;
            };
            let is_match: bool = candidate.as_bytes().ct_eq(plaintext.as_bytes()).into();
            matched |= is_match;
        }

        if matched {
            Ok(())
        } else {
            Err(Error::InvalidPsk)
        }
    }

    /// Rotates the active PSK: existing `active` rows move to `grace` with a
    /// deadline `grace_period` out, a new `active` row is inserted, and the
    /// on-disk file is overwritten with the new PSK — all inside one
    /// transaction, with the file write happening after the DB mutations
    /// but before commit, per the spec's accepted (DB-governs-truth) failure
    /// asymmetry. Returns the new PSK.
    pub fn rotate(
        &self,
        fs_store: &FilesystemStore,
        root_key: &PrivateKey,
        colony_id: &str,
        grace_period: Duration,
    ) -> Result<String> {
        let key = derive_key(root_key)?;
        let new_psk = generate();
        let (ciphertext, nonce) = encrypt(&key, &new_psk)?;
        let grace_expires_at = (Utc::now() + grace_period).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let id = nanosecond_id();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE bootstrap_psks SET status = 'grace', grace_expires_at = ?1 WHERE status = 'active'",
            params![grace_expires_at],
        )?;

        tx.execute(
            "INSERT INTO bootstrap_psks
                (id, colony_id, encrypted_psk, encryption_nonce, status, created_at,
                 grace_expires_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, NULL, NULL)",
            params![id, colony_id, ciphertext, nonce.as_slice(), now],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Duplicate(format!("PSK id {id} already present"))
            } else {
                Error::from(e)
            }
        })?;

        save_to_file(fs_store, &new_psk, root_key)?;

        tx.commit()?;
        info!(colony_id, "rotated bootstrap PSK");
        Ok(new_psk)
    }

    /// Returns the decrypted `active` PSK, or `NotFound` if none exists.
    pub fn get_active(&self, root_key: &PrivateKey) -> Result<String> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT encrypted_psk, encryption_nonce FROM bootstrap_psks WHERE status = 'active'
                 ORDER BY created_at DESC LIMIT 1",
                [],
                |row| {
                    let ciphertext: Vec<u8> = row.get(0)?;
                    let nonce: Vec<u8> = row.get(1)?;
                    Ok((ciphertext, nonce))
                },
            )
            .optional()?
        };
        let (ciphertext, nonce_bytes) =
            row.ok_or_else(|| Error::NotFound("no active bootstrap PSK".into()))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| Error::Storage("stored PSK nonce is not 12 bytes".into()))?;
        let key = derive_key(root_key)?;
        decrypt(&key, &ciphertext, &nonce)
    }

    /// Reads every row back as typed records, for tests and diagnostics.
    #[cfg(test)]
    fn all_records(&self) -> Result<Vec<BootstrapPskRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, colony_id, encrypted_psk, encryption_nonce, status, created_at,
                    grace_expires_at, revoked_at
             FROM bootstrap_psks",
        )?;
        let rows = stmt.query_map([], |row| {
            let nonce_bytes: Vec<u8> = row.get(3)?;
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&nonce_bytes);
            Ok(BootstrapPskRecord {
                id: row.get(0)?,
                colony_id: row.get(1)?,
                ciphertext: row.get(2)?,
                nonce,
                status: PskStatus::parse(&row.get::<_, String>(4)?).unwrap_or(PskStatus::Revoked),
                created_at: row
                    .get::<_, String>(5)?
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                grace_expires_at: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                revoked_at: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Storage(format!("PSK vault connection lock poisoned: {e}")))
    }
}

fn nanosecond_id() -> String {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_millis() * 1_000_000)
        .to_string()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                ..
            },
            _
        )
    )
}
