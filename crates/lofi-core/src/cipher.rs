//! Field encryption at rest
//!
//! Documents live in memory in plaintext. Fields flagged `encrypted` in the
//! collection schema are sealed on their way to storage and opened on load.
//! Key management is the caller's business: the database only ever sees a
//! password (or a custom [`FieldCipher`]).

use crate::error::{Error, Result};
use crate::schema::CollectionSchema;
use crate::value::Value;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"lofi-field-encryption-v1";

/// Prefix marking a sealed field value
const SEALED_PREFIX: &str = "enc:";

/// Symmetric cipher for field values
pub trait FieldCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a key derived from a password via HKDF-SHA256
pub struct PasswordCipher {
    key: [u8; 32],
}

impl PasswordCipher {
    pub fn new(password: &str) -> Result<Self> {
        if password.len() < 8 {
            return Err(Error::Encryption(
                "password must be at least 8 characters".into(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(None, password.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { key })
    }
}

impl FieldCipher for PasswordCipher {
    /// Returns nonce || ciphertext
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| Error::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::Encryption("ciphertext too short (missing nonce)".into()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| Error::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

/// Replace every encrypted field of `data` by its sealed form
pub fn seal_fields(schema: &CollectionSchema, data: &Value, cipher: &dyn FieldCipher) -> Result<Value> {
    let mut sealed = data.clone();
    if let Some(fields) = sealed.as_object_mut() {
        for descriptor in schema.encrypted_fields() {
            if let Some(value) = fields.get_mut(&descriptor.name) {
                if value.is_null() {
                    continue;
                }
                let plaintext = serde_json::to_vec(value)?;
                let ciphertext = cipher.encrypt(&plaintext)?;
                *value = Value::String(format!("{}{}", SEALED_PREFIX, hex::encode(ciphertext)));
            }
        }
    }
    Ok(sealed)
}

/// Inverse of [`seal_fields`]
pub fn open_fields(schema: &CollectionSchema, data: &Value, cipher: &dyn FieldCipher) -> Result<Value> {
    let mut opened = data.clone();
    if let Some(fields) = opened.as_object_mut() {
        for descriptor in schema.encrypted_fields() {
            let sealed = match fields.get(&descriptor.name).and_then(Value::as_str) {
                Some(s) => match s.strip_prefix(SEALED_PREFIX) {
                    Some(hex_str) => hex_str.to_string(),
                    None => continue,
                },
                None => continue,
            };
            let ciphertext = hex::decode(&sealed).map_err(|e| Error::Encryption(e.to_string()))?;
            let plaintext = cipher.decrypt(&ciphertext)?;
            let value: Value = serde_json::from_slice(&plaintext)?;
            fields.insert(descriptor.name.clone(), value);
        }
    }
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use serde_json::json;

    fn list_schema() -> CollectionSchema {
        CollectionSchema::new("list")
            .field(FieldDescriptor::string("description").encrypted())
            .field(FieldDescriptor::string("list_id").required())
    }

    #[test]
    fn test_password_cipher() {
        let cipher = PasswordCipher::new("sudoLetMeIn").unwrap();
        let sealed = cipher.encrypt(b"secret").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"secret");

        let other = PasswordCipher::new("another-password").unwrap();
        assert!(other.decrypt(&sealed).is_err());
        assert!(PasswordCipher::new("short").is_err());
    }

    #[test]
    fn test_seal_and_open_fields() {
        let schema = list_schema();
        let cipher = PasswordCipher::new("sudoLetMeIn").unwrap();
        let data = Value::from(json!({"id": "1", "description": "enkripsi", "list_id": "abc"}));

        let sealed = seal_fields(&schema, &data, &cipher).unwrap();
        let stored = sealed.get_path("description").and_then(Value::as_str).unwrap();
        assert!(stored.starts_with(SEALED_PREFIX));
        assert!(!stored.contains("enkripsi"));
        assert_eq!(sealed.get_path("list_id"), data.get_path("list_id"));

        assert_eq!(open_fields(&schema, &sealed, &cipher).unwrap(), data);
    }
}
