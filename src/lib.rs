//! Colony Certificate Authority (CCA) core.
#![forbid(unsafe_code)]
//!
//! An embedded, per-colony public-key infrastructure: issuance, storage,
//! revocation, and rotation of X.509 mTLS credentials across a three-level
//! hierarchy (Root → intermediates → leaves), a Bootstrap Pre-Shared Key
//! lifecycle for first-contact agent enrollment, and stateless validation
//! of signed referral tickets.
//!
//! # Overview
//!
//! `cca-core` has no binary entry point; a colony runtime links it directly
//! and drives everything through [`manager::CaManager`]:
//! - Creating a new colony's PKI hierarchy, or loading an existing one
//! - Issuing agent and server leaf certificates under the right intermediate
//! - Revoking issued certificates and querying the revocation ledger
//! - Rotating an intermediate CA with atomic archive-then-install semantics
//! - Generating, validating, and rotating the colony's bootstrap PSK
//! - Validating EdDSA-signed referral-ticket JWTs against a JWKS cache
//!
//! # Example
//!
//! ```no_run
//! use cca_core::manager::{CaManager, CaManagerConfig};
//! use cca_core::jwks::JwksKeysource;
//! use cca_core::Result;
//!
//! struct NoKeysYet;
//! impl JwksKeysource for NoKeysYet {
//!     fn get_key_by_kid(&self, _kid: &str) -> Result<Vec<u8>> {
//!         Err(cca_core::Error::NotFound("no JWKS configured".into()))
//!     }
//! }
//!
//! let db = rusqlite::Connection::open("./colony-a.db").unwrap();
//! let manager = CaManager::new(
//!     db,
//!     CaManagerConfig {
//!         colony_id: "colony-a".to_string(),
//!         ca_dir: "./ca".into(),
//!         jwks_keysource: NoKeysYet,
//!         kms_key_id: None,
//!     },
//! )
//! .unwrap();
//!
//! println!("root fingerprint: {}", manager.ca_fingerprint().unwrap());
//! ```
//!
//! # Modules
//!
//! - [`fs_store`] - permission-hardened on-disk persistence of certs/keys
//! - [`crypto`] - pure signing operations over an already-loaded hierarchy
//! - [`ledger`] - transactional issued-certificate metadata and revocations
//! - [`psk`] - bootstrap PSK generation, envelope encryption, rotation
//! - [`jwks`] - JWKS key resolution for referral-ticket validation
//! - [`policy`] - stateless CSR/referral-ticket policy checks
//! - [`manager`] - the lifecycle façade composing everything above
//! - [`chain`] - standalone X.509 path validation over a certificate chain
//! - [`retry`] - retry-with-backoff for transient database conflicts
//! - [`keyfmt`] - PKCS#8/SEC1 private key format conversion
//! - [`types`] - core data model
//! - [`error`] - error types

pub mod chain;
pub mod crypto;
pub mod error;
pub mod fs_store;
pub mod jwks;
pub mod keyfmt;
pub mod ledger;
pub mod manager;
pub mod policy;
pub mod psk;
pub mod retry;
pub mod types;

pub use error::{Error, Result};
pub use manager::{CaManager, CaManagerConfig, CaStatus};
pub use types::{Certificate, CertRequest, PrivateKey};
