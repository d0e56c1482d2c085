//! 凭证引用解析：`enc:` 走 AES-GCM，`env:` 读环境变量，`plain:` 仅用于本地开发

use async_trait::async_trait;

use super::traits::SecretResolver;
use crate::config::{ConfigCrypto, ENCRYPTED_PREFIX};
use crate::bail;
use crate::error::{GatewayError, Result};

/// 默认凭证解析器
#[derive(Debug, Default)]
pub struct ReferenceSecretResolver {
    crypto: Option<ConfigCrypto>,
}

impl ReferenceSecretResolver {
    #[must_use]
    pub const fn new(crypto: Option<ConfigCrypto>) -> Self {
        Self { crypto }
    }
}

#[async_trait]
impl SecretResolver for ReferenceSecretResolver {
    async fn resolve(&self, reference: &str) -> Result<String> {
        if reference.starts_with(ENCRYPTED_PREFIX) {
            let crypto = self
                .crypto
                .as_ref()
                .ok_or_else(|| GatewayError::credential("no decryption key configured"))?;
            return crypto.decrypt(reference);
        }
        if let Some(var) = reference.strip_prefix("env:") {
            return std::env::var(var)
                .map_err(|e| GatewayError::credential_with_source(format!("env {var} unset"), e));
        }
        let Some(value) = reference.strip_prefix("plain:") else {
            bail!(Credential, "unknown credential reference scheme");
        };
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_each_scheme() {
        let crypto = ConfigCrypto::from_hex(&ConfigCrypto::generate_key()).unwrap();
        let enc = crypto.encrypt("s3cret").unwrap();
        let resolver = ReferenceSecretResolver::new(Some(crypto));
        assert_eq!(resolver.resolve(&enc).await.unwrap(), "s3cret");
        assert_eq!(resolver.resolve("plain:abc").await.unwrap(), "abc");
        assert!(resolver.resolve("vault:abc").await.is_err());
        assert!(resolver.resolve("env:MODEL_GATEWAY_SURELY_UNSET").await.is_err());
    }

    #[tokio::test]
    async fn encrypted_reference_without_key_fails() {
        let resolver = ReferenceSecretResolver::default();
        assert!(matches!(
            resolver.resolve("enc:AAAA:BBBB").await,
            Err(GatewayError::Credential { .. })
        ));
    }
}
