//! Conversions between PKCS#8 (what `rcgen` hands back from key generation)
//! and SEC1 "EC PRIVATE KEY" DER (the on-disk format this crate commits to).
//!
//! Grounded on the same `p256` ECDSA P-256 primitives `cim-keys` uses
//! elsewhere in the pack for raw scalar access; `rcgen` itself only exposes
//! PKCS#8, so every key that touches disk passes through here once.

use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::SecretKey;

use crate::error::{Error, Result};

/// Converts an rcgen-produced PKCS#8 DER key into SEC1 DER.
pub(crate) fn pkcs8_to_sec1(pkcs8_der: &[u8]) -> Result<Vec<u8>> {
    let secret_key = SecretKey::from_pkcs8_der(pkcs8_der)
        .map_err(|e| Error::Crypto(format!("invalid PKCS#8 key: {e}")))?;
    let sec1 = secret_key
        .to_sec1_der()
        .map_err(|e| Error::Crypto(format!("SEC1 encoding failed: {e}")))?;
    Ok(sec1.as_bytes().to_vec())
}

/// Converts a SEC1 DER key (as read back from disk) into PKCS#8 DER, the
/// form `rcgen::KeyPair::try_from` accepts.
pub(crate) fn sec1_to_pkcs8(sec1_der: &[u8]) -> Result<Vec<u8>> {
    let secret_key = SecretKey::from_sec1_der(sec1_der)
        .map_err(|e| Error::Crypto(format!("invalid SEC1 key: {e}")))?;
    let pkcs8 = secret_key
        .to_pkcs8_der()
        .map_err(|e| Error::Crypto(format!("PKCS#8 encoding failed: {e}")))?;
    Ok(pkcs8.as_bytes().to_vec())
}

/// Extracts the raw 32-byte curve scalar `D` from a PKCS#8-encoded P-256 key.
///
/// Used only by the PSK vault to derive its envelope-encryption key from the
/// Root CA private key; the scalar is never persisted.
pub(crate) fn scalar_from_pkcs8(pkcs8_der: &[u8]) -> Result<[u8; 32]> {
    let secret_key = SecretKey::from_pkcs8_der(pkcs8_der)
        .map_err(|e| Error::Crypto(format!("invalid PKCS#8 key: {e}")))?;
    let bytes = secret_key.to_bytes();
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(bytes.as_slice());
    Ok(scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::KeyPair;

    #[test]
    fn pkcs8_sec1_roundtrip_preserves_scalar() {
        let key_pair = KeyPair::generate().expect("keygen");
        let pkcs8 = key_pair.serialize_der();

        let sec1 = pkcs8_to_sec1(&pkcs8).expect("to sec1");
        let back = sec1_to_pkcs8(&sec1).expect("back to pkcs8");

        let scalar_a = scalar_from_pkcs8(&pkcs8).expect("scalar a");
        let scalar_b = scalar_from_pkcs8(&back).expect("scalar b");
        assert_eq!(scalar_a, scalar_b);
    }

    #[test]
    fn scalar_is_deterministic_for_same_key() {
        let key_pair = KeyPair::generate().expect("keygen");
        let pkcs8 = key_pair.serialize_der();

        let a = scalar_from_pkcs8(&pkcs8).expect("scalar a");
        let b = scalar_from_pkcs8(&pkcs8).expect("scalar b");
        assert_eq!(a, b);
    }
}
