// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Node identity and per-peer session crypto: ECDH key agreement and ECDSA
//! signing on P-384, HKDF-SHA256 session key derivation, and AES-256-CBC with
//! PKCS7 padding for message confidentiality.
//!
//! Deliberately unauthenticated at the AEAD level: CBC gives no integrity
//! guarantee on its own. That mirrors the original design this component was
//! distilled from and is preserved rather than "fixed" here; see DESIGN.md.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ecdsa::signature::{Signer, Verifier};
use hkdf::Hkdf;
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p384::{ecdh, ecdsa, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;
const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("io error persisting node identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("key encoding error: {0}")]
    Encoding(String),
    #[error("no established session for peer {0}")]
    NoSession(String),
    #[error("ciphertext too short to contain an IV")]
    Truncated,
    #[error("padding or decryption failure")]
    BadPadding,
    #[error("signature verification failed")]
    BadSignature,
}

/// The node's long-lived P-384 keypair, used both for ECDSA signing and, via
/// the same scalar, for repeated ECDH agreements with many peers.
///
/// `ring`'s `agreement` API only issues ephemeral, consume-on-use private
/// keys, which cannot back a static identity reused across peers, so this
/// uses the RustCrypto `p384` stack instead (see DESIGN.md).
pub struct NodeIdentity {
    secret: SecretKey,
    public: PublicKey,
    signing_key: ecdsa::SigningKey,
    node_id: String,
}

impl NodeIdentity {
    /// Loads the identity keypair from `data_dir`, generating and atomically
    /// persisting a fresh one on first run.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, CryptoError> {
        fs::create_dir_all(data_dir)?;
        let priv_path = data_dir.join("node_identity.pem");
        let pub_path = data_dir.join("node_identity.pub.pem");

        let secret = if priv_path.exists() {
            let pem = fs::read_to_string(&priv_path)?;
            SecretKey::from_pkcs8_pem(&pem).map_err(|e| CryptoError::Encoding(e.to_string()))?
        } else {
            let secret = SecretKey::random(&mut OsRng);
            let priv_pem = secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Encoding(e.to_string()))?;
            atomic_write(&priv_path, priv_pem.as_bytes())?;

            let pub_pem = secret
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Encoding(e.to_string()))?;
            atomic_write(&pub_path, pub_pem.as_bytes())?;
            secret
        };

        let public = secret.public_key();
        let signing_key = ecdsa::SigningKey::from(secret.clone());
        let node_id = fingerprint(&public)?;

        Ok(Self {
            secret,
            public,
            signing_key,
            node_id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

fn fingerprint(public: &PublicKey) -> Result<String, CryptoError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(ZeroizeOnDrop)]
struct SessionEntry {
    key: [u8; SESSION_KEY_LEN],
    #[zeroize(skip)]
    peer_public: PublicKey,
}

/// Owns the node's identity and every established peer session key.
/// Safe to share as `Arc<CryptoContext>` across all connection tasks.
pub struct CryptoContext {
    identity: NodeIdentity,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl CryptoContext {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.identity.public_key_pem()
    }

    /// Performs ECDH with `peer_public_pem` and derives a 256-bit AES key via
    /// HKDF-SHA256 over the raw shared secret (empty salt, info
    /// `b"session_key"`), replacing any prior session for this peer.
    pub fn establish_session(&self, peer_id: &str, peer_public_pem: &str) -> Result<(), CryptoError> {
        let peer_public = PublicKey::from_public_key_pem(peer_public_pem)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let key = derive_session_key(&self.identity.secret, &peer_public, &[])?;
        self.sessions.lock().unwrap().insert(
            peer_id.to_string(),
            SessionEntry { key, peer_public },
        );
        Ok(())
    }

    /// Re-runs key agreement for an already-established peer, mixing a fresh
    /// random salt into the HKDF so the rotated key is never the one being
    /// replaced, then swaps it in under a single lock acquisition so no
    /// reader ever observes a half-updated key.
    pub fn rotate_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        let peer_public = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(peer_id)
                .map(|e| e.peer_public)
                .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?
        };
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let key = derive_session_key(&self.identity.secret, &peer_public, &salt)?;
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(peer_id) {
            entry.key = key;
        }
        Ok(())
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(peer_id)
    }

    pub fn drop_session(&self, peer_id: &str) {
        self.sessions.lock().unwrap().remove(peer_id);
    }

    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer_id)?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ct = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut out = Vec::with_capacity(IV_LEN + ct.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, peer_id: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < IV_LEN {
            return Err(CryptoError::Truncated);
        }
        let key = self.session_key(peer_id)?;
        let (iv, ct) = blob.split_at(IV_LEN);
        Aes256CbcDec::new(&key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|_| CryptoError::BadPadding)
    }

    fn session_key(&self, peer_id: &str) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
        self.sessions
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|e| e.key)
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sig: ecdsa::Signature = self.identity.signing_key.sign(message);
        sig.to_bytes().to_vec()
    }

    /// Verifies `signature` against `message` using the public key stored
    /// for `peer_id` from its established session.
    pub fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .get(peer_id)
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;
        let verifying_key = ecdsa::VerifyingKey::from(&entry.peer_public);
        let sig = ecdsa::Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}

fn derive_session_key(
    secret: &SecretKey,
    peer_public: &PublicKey,
    salt: &[u8],
) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public.as_affine());
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, shared.raw_secret_bytes());
    let mut key = [0u8; SESSION_KEY_LEN];
    hk.expand(b"session_key", &mut key)
        .map_err(|_| CryptoError::Encoding("hkdf expand failed".into()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity() -> NodeIdentity {
        let dir = tempdir().unwrap();
        NodeIdentity::load_or_create(dir.path()).unwrap()
    }

    #[test]
    fn identity_persists_across_reload() {
        let dir = tempdir().unwrap();
        let first = NodeIdentity::load_or_create(dir.path()).unwrap();
        let second = NodeIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn ecdh_session_keys_agree() {
        let a = CryptoContext::new(identity());
        let b = CryptoContext::new(identity());
        a.establish_session("b", &b.public_key_pem().unwrap()).unwrap();
        b.establish_session("a", &a.public_key_pem().unwrap()).unwrap();

        let key_a = a.session_key("b").unwrap();
        let key_b = b.session_key("a").unwrap();
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn round_trip_encrypt_decrypt() {
        let a = CryptoContext::new(identity());
        let b = CryptoContext::new(identity());
        a.establish_session("b", &b.public_key_pem().unwrap()).unwrap();
        b.establish_session("a", &a.public_key_pem().unwrap()).unwrap();

        let ct = a.encrypt("b", b"hello peer").unwrap();
        let pt = b.decrypt("a", &ct).unwrap();
        assert_eq!(pt, b"hello peer");
    }

    #[test]
    fn decrypt_without_session_fails() {
        let a = CryptoContext::new(identity());
        assert!(matches!(a.decrypt("nobody", &[0u8; 32]), Err(CryptoError::NoSession(_))));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let a = CryptoContext::new(identity());
        let b = CryptoContext::new(identity());
        b.establish_session("a", &a.public_key_pem().unwrap()).unwrap();

        let sig = a.sign(b"important");
        assert!(b.verify("a", b"important", &sig).is_ok());
        assert!(b.verify("a", b"tampered", &sig).is_err());
    }

    #[test]
    fn rotate_produces_a_fresh_key() {
        let a = CryptoContext::new(identity());
        let b = CryptoContext::new(identity());
        a.establish_session("b", &b.public_key_pem().unwrap()).unwrap();

        let before = a.session_key("b").unwrap();
        a.rotate_session("b").unwrap();
        let after = a.session_key("b").unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn message_encrypted_before_rotation_does_not_decrypt_under_the_rotated_key() {
        let a = CryptoContext::new(identity());
        a.establish_session("b", &CryptoContext::new(identity()).public_key_pem().unwrap())
            .unwrap();

        let ct1 = a.encrypt("b", b"first message").unwrap();
        a.rotate_session("b").unwrap();
        let ct2 = a.encrypt("b", b"second message").unwrap();

        assert!(a.decrypt("b", &ct1).is_err() || a.decrypt("b", &ct1).unwrap() != b"first message");
        assert_eq!(a.decrypt("b", &ct2).unwrap(), b"second message");
    }
}
