// src/crypto.rs - SHA-256, secp256k1 ECDSA, address derivation
use crate::constants::ADDRESS_LEN;
use crate::error::{NodeError, Result};
use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

/// SHA-256 digest of arbitrary bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 digest, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Generate a fresh keypair and its derived address.
/// Returns `(priv_hex, pub_hex_compressed, address)`.
pub fn keygen() -> (String, String, String) {
    let secp = Secp256k1::new();
    let mut rng = OsRng;
    let (secret_key, public_key) = secp.generate_keypair(&mut rng);
    let priv_hex = hex::encode(secret_key.secret_bytes());
    let pub_hex = hex::encode(public_key.serialize());
    let address = address_of(&pub_hex).expect("freshly derived pubkey is always valid");
    (priv_hex, pub_hex, address)
}

/// Derive the compressed public key (hex) from a private key (hex).
pub fn derive_pub(priv_hex: &str) -> Result<String> {
    let secp = Secp256k1::new();
    let bytes = hex::decode(priv_hex)?;
    let secret_key = SecretKey::from_slice(&bytes)?;
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);
    Ok(hex::encode(public_key.serialize()))
}

/// Derive the `J` + 64-hex address from a compressed public key (hex).
pub fn address_of(pub_hex: &str) -> Result<String> {
    let bytes = hex::decode(pub_hex)?;
    // validate it actually decodes to a point, matching the source's
    // expectation that only a well-formed compressed key ever reaches
    // address derivation.
    PublicKey::from_slice(&bytes)?;
    Ok(format!("J{}", sha256_hex(&bytes)))
}

/// `true` iff `addr` is exactly `J` followed by 64 lowercase hex digits.
pub fn is_valid_address_shape(addr: &str) -> bool {
    if addr.len() != ADDRESS_LEN {
        return false;
    }
    let mut chars = addr.chars();
    if chars.next() != Some('J') {
        return false;
    }
    chars.all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Sign `message` (already the canonical bytes to hash-and-sign) with
/// the given private key, returning a DER-encoded hex signature.
pub fn sign(priv_hex: &str, message: &[u8]) -> Result<String> {
    let secp = Secp256k1::new();
    let bytes = hex::decode(priv_hex)?;
    let secret_key = SecretKey::from_slice(&bytes)?;
    let digest = sha256(message);
    let msg = Message::from_slice(&digest)?;
    let sig = secp.sign_ecdsa(&msg, &secret_key);
    Ok(hex::encode(sig.serialize_der()))
}

/// Verify a DER-encoded hex signature over `message` against a
/// compressed public key (hex). Never raises: any parsing or
/// cryptographic failure simply yields `false`.
pub fn verify(pub_hex: &str, sig_hex: &str, message: &[u8]) -> bool {
    (|| -> Result<bool> {
        let secp = Secp256k1::new();
        let pub_bytes = hex::decode(pub_hex)?;
        let public_key = PublicKey::from_slice(&pub_bytes)?;
        let sig_bytes = hex::decode(sig_hex)?;
        let sig = Signature::from_der(&sig_bytes)?;
        let digest = sha256(message);
        let msg = Message::from_slice(&digest)?;
        Ok(secp.verify_ecdsa(&msg, &sig, &public_key).is_ok())
    })()
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keygen_roundtrips_through_derive_and_address() {
        let (priv_hex, pub_hex, addr) = keygen();
        assert_eq!(derive_pub(&priv_hex).unwrap(), pub_hex);
        assert_eq!(address_of(&pub_hex).unwrap(), addr);
        assert!(is_valid_address_shape(&addr));
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (priv_hex, pub_hex, _) = keygen();
        let message = b"transfer 100 units";
        let sig = sign(&priv_hex, message).unwrap();
        assert!(verify(&pub_hex, &sig, message));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let (priv_hex, pub_hex, _) = keygen();
        let sig = sign(&priv_hex, b"original").unwrap();
        assert!(!verify(&pub_hex, &sig, b"tampered"));
    }

    #[test]
    fn verify_never_panics_on_garbage_input() {
        assert!(!verify("not-hex", "not-hex", b"x"));
        assert!(!verify("", "", b""));
    }

    #[test]
    fn address_shape_rejects_wrong_length_and_prefix() {
        assert!(!is_valid_address_shape("Jabc"));
        assert!(!is_valid_address_shape(&"a".repeat(65)));
        assert!(!is_valid_address_shape(&format!("J{}", "g".repeat(64))));
    }
}
