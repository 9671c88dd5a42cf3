use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use crate::error::DecryptError;

const PLAINTEXT_PREFIX: &str = "PLAINTEXT:";
const V1_TAG: &str = "v1";
const NONCE_LEN: usize = 12;

/**
 * \brief API Key 的加解密器。
 * \details 未配置密钥时写入 `PLAINTEXT:` 前缀的明文（不安全的回退方案）；
 *          配置密钥后写入 `v1:<nonce>:<ciphertext>`，两段均为标准 base64。
 */
#[derive(Clone)]
pub struct SecretCipher {
    key: Option<Aes256Gcm>,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl SecretCipher {
    /**
     * \brief 不带密钥的加解密器，只能处理明文标记格式。
     */
    pub fn plaintext_only() -> Self {
        SecretCipher { key: None }
    }

    /**
     * \brief 由 base64 编码的 32 字节密钥构建；`None` 表示未配置。
     */
    pub fn from_base64_key(key_b64: Option<&str>) -> Result<Self> {
        let Some(raw) = key_b64 else {
            return Ok(Self::plaintext_only());
        };
        let bytes = STANDARD
            .decode(raw.trim())
            .map_err(|e| anyhow!("ENCRYPTION_KEY is not valid base64: {}", e))?;
        let key = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|_| anyhow!("ENCRYPTION_KEY must decode to 32 bytes, got {}", bytes.len()))?;
        Ok(SecretCipher { key: Some(key) })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /**
     * \brief 加密明文。
     */
    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(format!("{}{}", PLAINTEXT_PREFIX, plain));
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let sealed = key
            .encrypt(Nonce::from_slice(&nonce_bytes), plain.as_bytes())
            .map_err(|e| anyhow!("AES-GCM encryption failed: {}", e))?;
        Ok(format!(
            "{}:{}:{}",
            V1_TAG,
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(sealed)
        ))
    }

    /**
     * \brief 解密；只接受明文标记与 v1 两种格式。
     */
    pub fn decrypt(&self, enc: &str) -> Result<String, DecryptError> {
        if let Some(plain) = enc.strip_prefix(PLAINTEXT_PREFIX) {
            return Ok(plain.to_string());
        }
        let parts: Vec<&str> = enc.split(':').collect();
        let [tag, nonce_b64, data_b64] = parts.as_slice() else {
            return Err(DecryptError::BadFormat);
        };
        if *tag != V1_TAG {
            return Err(DecryptError::BadFormat);
        }
        let key = self.key.as_ref().ok_or(DecryptError::MissingKey)?;
        let nonce = STANDARD.decode(nonce_b64)?;
        if nonce.len() != NONCE_LEN {
            return Err(DecryptError::BadFormat);
        }
        let data = STANDARD.decode(data_b64)?;
        let plain = key
            .decrypt(Nonce::from_slice(&nonce), data.as_ref())
            .map_err(|_| DecryptError::Cipher)?;
        String::from_utf8(plain).map_err(|_| DecryptError::Cipher)
    }

    /**
     * \brief 解密可选密文，失败或结果为空时返回 `None`。
     */
    pub fn usable_key(&self, enc: Option<&str>) -> Option<String> {
        let plain = self.decrypt(enc?).ok()?;
        if plain.is_empty() {
            None
        } else {
            Some(plain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        STANDARD.encode([7u8; 32])
    }

    #[test]
    fn test_plaintext_fallback_without_key() {
        let c = SecretCipher::plaintext_only();
        let enc = c.encrypt("sk-1").expect("encrypt");
        assert_eq!(enc, "PLAINTEXT:sk-1");
        assert_eq!(c.decrypt(&enc).expect("decrypt"), "sk-1");
    }

    #[test]
    fn test_v1_envelope_with_key() {
        let c = SecretCipher::from_base64_key(Some(&test_key())).expect("cipher");
        let enc = c.encrypt("sk-secret").expect("encrypt");
        assert!(enc.starts_with("v1:"));
        assert_eq!(enc.split(':').count(), 3);
        assert_eq!(c.decrypt(&enc).expect("decrypt"), "sk-secret");
    }

    #[test]
    fn test_rejects_unknown_format() {
        let c = SecretCipher::from_base64_key(Some(&test_key())).expect("cipher");
        assert!(matches!(c.decrypt("sk-raw"), Err(DecryptError::BadFormat)));
        assert!(matches!(c.decrypt("v2:a:b"), Err(DecryptError::BadFormat)));
        assert!(matches!(c.decrypt("v1:only"), Err(DecryptError::BadFormat)));
    }

    #[test]
    fn test_v1_without_key_fails() {
        let keyed = SecretCipher::from_base64_key(Some(&test_key())).expect("cipher");
        let enc = keyed.encrypt("sk").expect("encrypt");
        let plain = SecretCipher::plaintext_only();
        assert!(matches!(plain.decrypt(&enc), Err(DecryptError::MissingKey)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = SecretCipher::from_base64_key(Some(&test_key())).expect("cipher");
        let other = SecretCipher::from_base64_key(Some(&STANDARD.encode([9u8; 32]))).expect("c2");
        let enc = other.encrypt("sk").expect("encrypt");
        assert!(matches!(c.decrypt(&enc), Err(DecryptError::Cipher)));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(SecretCipher::from_base64_key(Some(&STANDARD.encode([1u8; 16]))).is_err());
        assert!(SecretCipher::from_base64_key(Some("%%%")).is_err());
    }

    #[test]
    fn test_usable_key_filters_empty() {
        let c = SecretCipher::plaintext_only();
        assert_eq!(c.usable_key(Some("PLAINTEXT:")), None);
        assert_eq!(c.usable_key(None), None);
        assert_eq!(c.usable_key(Some("garbage")), None);
        assert_eq!(c.usable_key(Some("PLAINTEXT:k")).as_deref(), Some("k"));
    }
}
