use crate::types::base64_bytes;
use crate::{Error, KdfParams, Result};
use argon2::Argon2;
use chacha20poly1305::{
    ChaCha20Poly1305, Key as CipherKey, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Bytes added by [`Key::seal`]: nonce in front, tag at the end.
pub const CRYPTO_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// The repository key. All at-rest data is sealed with it; it is itself only
/// stored wrapped by passphrase-derived keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Encryption(format!("Key must be {KEY_SIZE} bytes")))?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

/// Authenticated encryption keyed by the repository key.
pub struct Key {
    cipher: ChaCha20Poly1305,
}

impl Key {
    pub fn new(master: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(CipherKey::from_slice(master.as_bytes())),
        }
    }

    /// Returns `nonce || ciphertext || tag`; the tag also covers `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Verifies the tag before any plaintext is released.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < CRYPTO_OVERHEAD {
            return Err(Error::integrity(
                "sealed object",
                format!("ciphertext too short ({} bytes)", sealed.len()),
            ));
        }

        let (nonce_bytes, encrypted) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: encrypted,
                    aad,
                },
            )
            .map_err(|_| Error::integrity("sealed object", "authentication failed"))
    }
}

/// Passphrase-wrapped copy of the repository key, stored under `keys/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Utc>,
    pub hostname: String,
    pub kdf: KdfParams,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl KeyFile {
    pub fn wrap(master: &MasterKey, passphrase: &str, kdf: KdfParams) -> Result<Self> {
        let wrapping_key = derive_wrapping_key(passphrase, &kdf)?;
        let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(wrapping_key.as_ref()));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = serde_json::to_vec(&kdf)?;
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: master.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut data = nonce.to_vec();
        data.extend_from_slice(&sealed);

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        Ok(Self {
            created: Utc::now(),
            hostname,
            kdf,
            data,
        })
    }

    /// Fails with [`Error::InvalidPassword`] for a wrong passphrase or a tampered key file.
    pub fn unwrap_key(&self, passphrase: &str) -> Result<MasterKey> {
        if self.data.len() < CRYPTO_OVERHEAD {
            return Err(Error::InvalidPassword);
        }
        let wrapping_key = derive_wrapping_key(passphrase, &self.kdf)?;
        let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(wrapping_key.as_ref()));
        let aad = serde_json::to_vec(&self.kdf)?;

        let (nonce_bytes, sealed) = self.data.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::InvalidPassword)?;
        let plaintext = Zeroizing::new(plaintext);

        MasterKey::from_slice(&plaintext).map_err(|_| Error::InvalidPassword)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn derive_wrapping_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if kdf.algorithm != "argon2id" {
        return Err(Error::Config(format!(
            "unsupported key derivation function {:?}",
            kdf.algorithm
        )));
    }
    let params = argon2::Params::new(kdf.memory, kdf.iterations, kdf.parallelism, Some(KEY_SIZE))
        .map_err(|e| Error::Config(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| Error::Encryption(format!("argon2: {e}")))?;
    Ok(output)
}
