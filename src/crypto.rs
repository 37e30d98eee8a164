//! Session confidentiality for enveloped control messages.
//!
//! Keys are agreed with an ephemeral X25519 exchange and stretched with
//! HKDF-SHA256. Each sealed message is AES-256-CBC with PKCS#7 padding under a
//! fresh random IV, laid out as `iv_len u32 | iv | ct_len u32 | ciphertext`.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Result, TransferError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const SALT_LEN: usize = 32;

const KEY_INFO: &[u8] = b"shuttle session key";

/// Symmetric key negotiated for one connection.
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

impl SessionCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` under a fresh IV.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(8 + IV_LEN + ciphertext.len());
        out.extend_from_slice(&(IV_LEN as u32).to_le_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt a sealed envelope.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let mut rest = sealed;
        let iv = take_prefixed(&mut rest, "iv")?;
        if iv.len() != IV_LEN {
            return Err(TransferError::Decryption(format!("bad iv length {}", iv.len())));
        }
        let ciphertext = take_prefixed(&mut rest, "ciphertext")?;
        if !rest.is_empty() {
            return Err(TransferError::Decryption("trailing bytes after ciphertext".into()));
        }
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(TransferError::Decryption(format!(
                "ciphertext length {} is not block aligned",
                ciphertext.len()
            )));
        }
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(iv);
        Aes256CbcDec::new(&self.key.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TransferError::Decryption("bad padding".into()))
    }
}

fn take_prefixed<'a>(rest: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if rest.len() < 4 {
        return Err(TransferError::Decryption(format!("truncated {what} length")));
    }
    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let body = &rest[4..];
    if body.len() < len {
        return Err(TransferError::Decryption(format!("truncated {what}")));
    }
    let (field, tail) = body.split_at(len);
    *rest = tail;
    Ok(field)
}

/// One side of an ephemeral X25519 exchange.
pub struct KeyAgreement {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Default for KeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAgreement {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Combine with the peer's public key and derive the session cipher.
    pub fn finish(self, peer_public: [u8; 32], salt: &[u8]) -> Result<SessionCipher> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(TransferError::ProtocolViolation(
                "peer sent a low-order public key".into(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
        let mut key = [0u8; KEY_LEN];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| TransferError::Decryption(format!("key derivation: {e}")))?;
        Ok(SessionCipher::new(key))
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreed_pair() -> (SessionCipher, SessionCipher) {
        let client = KeyAgreement::new();
        let server = KeyAgreement::new();
        let salt = random_salt();
        let (client_pub, server_pub) = (client.public_key(), server.public_key());
        (
            client.finish(server_pub, &salt).unwrap(),
            server.finish(client_pub, &salt).unwrap(),
        )
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let (client, server) = agreed_pair();
        let sealed = client.seal(b"download /data/report.pdf");
        assert_eq!(server.open(&sealed).unwrap(), b"download /data/report.pdf");
    }

    #[test]
    fn fresh_iv_per_message() {
        let cipher = SessionCipher::new([7u8; KEY_LEN]);
        let a = cipher.seal(b"same");
        let b = cipher.seal(b"same");
        assert_ne!(a, b);
        assert_eq!(&a[0..4], &(IV_LEN as u32).to_le_bytes());
        // 4 bytes of plaintext pad to a single block
        assert_eq!(a.len(), 4 + IV_LEN + 4 + 16);
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let sealed = SessionCipher::new([1u8; KEY_LEN]).seal(b"payload that spans two blocks!!");
        let other = SessionCipher::new([2u8; KEY_LEN]);
        // A wrong key almost always breaks the padding; never yields the plaintext
        if let Ok(p) = other.open(&sealed) {
            assert_ne!(p, b"payload that spans two blocks!!");
        }

        let right = SessionCipher::new([1u8; KEY_LEN]);
        assert!(right.open(&sealed[..sealed.len() - 3]).is_err());
        assert!(right.open(&[]).is_err());

        let mut extended = sealed.clone();
        extended.push(0);
        assert!(matches!(right.open(&extended), Err(TransferError::Decryption(_))));
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let (client, server) = agreed_pair();
        assert!(server.open(&client.seal(&[])).unwrap().is_empty());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let agreement = KeyAgreement::new();
        assert!(agreement.finish([0u8; 32], &random_salt()).is_err());
    }
}
