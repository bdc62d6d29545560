//! On-disk persistence of PEM-encoded certificates, private keys, and the
//! encrypted bootstrap PSK file, under a caller-supplied CA directory.
//!
//! Every write is permission-hardened: the directory is mode `0700`, every
//! file under it is mode `0600`. When the process runs as root (a
//! privilege-escalated installer, typically), ownership is handed back to
//! the invoking non-root user.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Certificate, PrivateKey};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Recognized cert/key basenames. Any other name is a programming error,
/// not a runtime one — callers never construct these from untrusted input.
const KNOWN_NAMES: &[&str] = &[
    "root-ca",
    "server-intermediate",
    "agent-intermediate",
    "policy-signing",
];

/// Owns the on-disk layout of a single colony's CA directory.
pub struct FilesystemStore {
    ca_dir: PathBuf,
}

impl FilesystemStore {
    #[must_use]
    pub fn new(ca_dir: impl Into<PathBuf>) -> Self {
        Self {
            ca_dir: ca_dir.into(),
        }
    }

    #[must_use]
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Creates the CA directory tree at mode `0700` if it doesn't exist.
    pub fn ensure_ca_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.ca_dir)
            .map_err(|e| Error::Io(format!("failed to create {}: {e}", self.ca_dir.display())))?;
        set_mode(&self.ca_dir, DIR_MODE)?;
        Ok(())
    }

    /// True iff `root-ca.crt` is present under the CA directory.
    #[must_use]
    pub fn ca_exists(&self) -> bool {
        self.cert_path("root-ca").exists()
    }

    /// Writes `<name>.crt` and `<name>.key`, both at mode `0600`.
    pub fn save_cert_and_key(&self, name: &str, cert: &Certificate, key: &PrivateKey) -> Result<()> {
        assert_known_name(name)?;

        let cert_path = self.cert_path(name);
        let key_path = self.key_path(name);

        fs::write(&cert_path, cert.pem())
            .map_err(|e| Error::Io(format!("failed to write {}: {e}", cert_path.display())))?;
        set_mode(&cert_path, FILE_MODE)?;

        fs::write(&key_path, key.pem())
            .map_err(|e| Error::Io(format!("failed to write {}: {e}", key_path.display())))?;
        set_mode(&key_path, FILE_MODE)?;

        info!(name, "wrote certificate and key pair");
        Ok(())
    }

    /// Reads and parses `<name>.crt`.
    pub fn load_cert(&self, name: &str) -> Result<Certificate> {
        assert_known_name(name)?;
        let path = self.cert_path(name);
        let pem = fs::read_to_string(&path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;
        Certificate::from_pem(&pem)
    }

    /// Reads and parses `<name>.key`.
    pub fn load_key(&self, name: &str) -> Result<PrivateKey> {
        assert_known_name(name)?;
        let path = self.key_path(name);
        let pem = fs::read_to_string(&path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;
        PrivateKey::from_pem(&pem)
    }

    /// Renames `<name>.crt`/`<name>.key` to `<name>.old.<timestamp>.{crt,key}`,
    /// timestamp in `YYYYMMDDhhmmss` (UTC).
    pub fn archive_cert_and_key(&self, name: &str) -> Result<()> {
        assert_known_name(name)?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");

        let cert_path = self.cert_path(name);
        let archived_cert = self.ca_dir.join(format!("{name}.old.{timestamp}.crt"));
        fs::rename(&cert_path, &archived_cert).map_err(|e| {
            Error::Io(format!(
                "failed to archive {} to {}: {e}",
                cert_path.display(),
                archived_cert.display()
            ))
        })?;

        let key_path = self.key_path(name);
        let archived_key = self.ca_dir.join(format!("{name}.old.{timestamp}.key"));
        fs::rename(&key_path, &archived_key).map_err(|e| {
            Error::Io(format!(
                "failed to archive {} to {}: {e}",
                key_path.display(),
                archived_key.display()
            ))
        })?;

        info!(name, %timestamp, "archived certificate and key pair");
        Ok(())
    }

    /// Writes an arbitrary secret blob (the encrypted PSK file) at mode
    /// `0600` under the CA directory.
    pub fn write_secret_file(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let path = self.ca_dir.join(filename);
        fs::write(&path, contents)
            .map_err(|e| Error::Io(format!("failed to write {}: {e}", path.display())))?;
        set_mode(&path, FILE_MODE)?;
        Ok(())
    }

    /// Reads back a secret blob previously written by `write_secret_file`.
    /// Returns `NotFound` if absent, distinguishing "never imported" from
    /// an I/O failure.
    pub fn read_secret_file(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.ca_dir.join(filename);
        if !path.exists() {
            return Err(Error::NotFound(format!("{filename} not present in CA directory")));
        }
        fs::read(&path).map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))
    }

    /// No-op unless the process is running as root. Otherwise `chown`s the
    /// directory and every entry in it to the invoking non-root user,
    /// discovered from `SUDO_UID`/`SUDO_GID`, falling back to the current
    /// real uid/gid when no elevation wrapper is detected.
    pub fn fix_ownership(&self) -> Result<()> {
        fix_ownership_impl(&self.ca_dir)
    }

    fn cert_path(&self, name: &str) -> PathBuf {
        self.ca_dir.join(format!("{name}.crt"))
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.ca_dir.join(format!("{name}.key"))
    }
}

fn assert_known_name(name: &str) -> Result<()> {
    if KNOWN_NAMES.contains(&name) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("unrecognized CA file name: {name}")))
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .map_err(|e| Error::Io(format!("failed to stat {}: {e}", path.display())))?
        .permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
        .map_err(|e| Error::Io(format!("failed to set permissions on {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn fix_ownership_impl(ca_dir: &Path) -> Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }

    let (uid, gid) = invoking_user();
    let entries = fs::read_dir(ca_dir)
        .map_err(|e| Error::Io(format!("failed to list {}: {e}", ca_dir.display())))?;

    chown(ca_dir, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| Error::Io(format!("failed to chown {}: {e}", ca_dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::Io(format!("failed to read directory entry: {e}")))?;
        let path = entry.path();
        chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| Error::Io(format!("failed to chown {}: {e}", path.display())))?;
    }

    debug!(uid, gid, "fixed ownership of CA directory");
    Ok(())
}

#[cfg(not(unix))]
fn fix_ownership_impl(_ca_dir: &Path) -> Result<()> {
    Ok(())
}

/// Discovers the invoking non-root user's uid/gid from the elevation
/// wrapper's environment hints, falling back to the process's real
/// (pre-setuid) uid/gid when nothing elevated it.
#[cfg(unix)]
fn invoking_user() -> (u32, u32) {
    if let (Ok(uid), Ok(gid)) = (std::env::var("SUDO_UID"), std::env::var("SUDO_GID")) {
        if let (Ok(uid), Ok(gid)) = (uid.parse(), gid.parse()) {
            return (uid, gid);
        }
    }
    use nix::unistd::{getgid, getuid};
    (getuid().as_raw(), getgid().as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_root_certificate;
    use crate::types::Serial;

    #[test]
    fn ensure_ca_directory_sets_0700() {
        let dir = tempfile::tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        let store = FilesystemStore::new(&ca_dir);
        store.ensure_ca_directory().unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&ca_dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn save_and_load_cert_and_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store.ensure_ca_directory().unwrap();

        let (cert, key) = generate_root_certificate("colony-a", Serial::fixed(1)).unwrap();
        store.save_cert_and_key("root-ca", &cert, &key).unwrap();

        assert!(store.ca_exists());

        let reloaded_cert = store.load_cert("root-ca").unwrap();
        let reloaded_key = store.load_key("root-ca").unwrap();
        assert_eq!(reloaded_cert.subject(), cert.subject());
        assert_eq!(reloaded_key.der(), key.der());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("root-ca.key"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn unrecognized_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store.ensure_ca_directory().unwrap();

        let (cert, key) = generate_root_certificate("colony-a", Serial::fixed(1)).unwrap();
        let result = store.save_cert_and_key("not-a-real-name", &cert, &key);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn archive_renames_with_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store.ensure_ca_directory().unwrap();

        let (cert, key) = generate_root_certificate("colony-a", Serial::fixed(1)).unwrap();
        store.save_cert_and_key("agent-intermediate", &cert, &key).unwrap();

        store.archive_cert_and_key("agent-intermediate").unwrap();

        assert!(!dir.path().join("agent-intermediate.crt").exists());
        let archived: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("agent-intermediate.old."))
            .collect();
        assert_eq!(archived.len(), 2);
    }

    #[test]
    fn secret_file_roundtrips_at_0600() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store.ensure_ca_directory().unwrap();

        store.write_secret_file("bootstrap-psk.enc", b"{}").unwrap();
        let back = store.read_secret_file("bootstrap-psk.enc").unwrap();
        assert_eq!(back, b"{}");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("bootstrap-psk.enc"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn missing_secret_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        store.ensure_ca_directory().unwrap();

        let result = store.read_secret_file("bootstrap-psk.enc");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
