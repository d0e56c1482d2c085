//! # 凭证加密模块
//!
//! 上游凭证以不透明引用保存，格式为 `enc:<nonce>:<ciphertext>`（均为 base64），
//! 由 AES-256-GCM 加解密。

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;

use crate::bail;
use crate::error::{GatewayError, Result};

/// 加密引用前缀
pub const ENCRYPTED_PREFIX: &str = "enc:";

/// 凭证加密器
pub struct ConfigCrypto {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ConfigCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfigCrypto(..)")
    }
}

impl ConfigCrypto {
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        let key: [u8; 32] = *key;
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// 从 64 位十六进制字符串创建
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| GatewayError::config_with_source("加密密钥格式错误", e))?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| GatewayError::config("加密密钥必须是32字节（64个十六进制字符）"))?;
        Ok(Self::new(&key))
    }

    /// 从环境变量读取密钥
    pub fn from_env(var: &str) -> Result<Self> {
        let key_hex = std::env::var(var)
            .map_err(|_| GatewayError::config(format!("环境变量 {var} 未设置")))?;
        Self::from_hex(&key_hex)
    }

    /// 加密为 `enc:` 引用
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| {
                GatewayError::credential_with_source(
                    "凭证加密失败",
                    anyhow::anyhow!("AES-GCM encryption failed: {e}"),
                )
            })?;
        Ok(format!(
            "{ENCRYPTED_PREFIX}{}:{}",
            general_purpose::STANDARD.encode(nonce),
            general_purpose::STANDARD.encode(ciphertext)
        ))
    }

    /// 解密 `enc:` 引用
    pub fn decrypt(&self, reference: &str) -> Result<String> {
        let Some(body) = reference.strip_prefix(ENCRYPTED_PREFIX) else {
            bail!(Credential, "凭证引用不是加密格式");
        };
        let (nonce_b64, data_b64) = body
            .split_once(':')
            .ok_or_else(|| GatewayError::credential("加密凭证格式错误"))?;

        let nonce_bytes = general_purpose::STANDARD
            .decode(nonce_b64)
            .map_err(|e| GatewayError::credential_with_source("加密随机数格式错误", e))?;
        let nonce_bytes: [u8; 12] = nonce_bytes
            .try_into()
            .map_err(|_| GatewayError::credential("加密随机数长度错误"))?;
        let ciphertext = general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|e| GatewayError::credential_with_source("加密数据格式错误", e))?;

        let plaintext = self
            .cipher
            .decrypt(&nonce_bytes.into(), ciphertext.as_ref())
            .map_err(|e| {
                GatewayError::credential_with_source(
                    "凭证解密失败",
                    anyhow::anyhow!("AES-GCM decryption failed: {e}"),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| GatewayError::credential_with_source("解密结果不是有效的UTF-8", e))
    }

    /// 生成新的加密密钥
    #[must_use]
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let crypto = ConfigCrypto::from_hex(&ConfigCrypto::generate_key()).unwrap();
        let reference = crypto.encrypt("sk-upstream-secret").unwrap();
        assert!(reference.starts_with("enc:"));
        assert!(!reference.contains("sk-upstream-secret"));
        assert_eq!(crypto.decrypt(&reference).unwrap(), "sk-upstream-secret");
    }

    #[test]
    fn wrong_key_fails_as_credential_error() {
        let a = ConfigCrypto::from_hex(&ConfigCrypto::generate_key()).unwrap();
        let b = ConfigCrypto::from_hex(&ConfigCrypto::generate_key()).unwrap();
        let reference = a.encrypt("secret").unwrap();
        assert!(matches!(
            b.decrypt(&reference),
            Err(GatewayError::Credential { .. })
        ));
    }

    #[test]
    fn short_key_rejected() {
        assert!(ConfigCrypto::from_hex("abcd").is_err());
    }
}
