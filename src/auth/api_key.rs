//! # API key 解析
//!
//! 调用方 token 形如 `sk-<prefix>-<secret>`；前缀用于查找记录，完整 token 用于哈希校验。

use crate::error::AuthError;

/// 解析后的调用方 token
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedApiKey {
    pub prefix: String,
    /// 完整 token，仅用于哈希校验
    pub token: String,
}

impl std::fmt::Debug for ParsedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedApiKey")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// 解析 token 本身
pub fn parse_token(token: &str) -> Result<ParsedApiKey, AuthError> {
    let rest = token.strip_prefix("sk-").ok_or(AuthError::ApiKeyMalformed)?;
    let (prefix, secret) = rest.split_once('-').ok_or(AuthError::ApiKeyMalformed)?;
    if prefix.is_empty()
        || secret.is_empty()
        || !prefix.chars().all(|c| c.is_ascii_alphanumeric())
        || token.chars().any(char::is_whitespace)
    {
        return Err(AuthError::ApiKeyMalformed);
    }
    Ok(ParsedApiKey {
        prefix: prefix.to_string(),
        token: token.to_string(),
    })
}

/// 解析 `Authorization: Bearer <token>` 头
pub fn parse_bearer(header: Option<&str>) -> Result<ParsedApiKey, AuthError> {
    let header = header.ok_or(AuthError::ApiKeyMalformed)?.trim();
    let (scheme, token) = header.split_once(' ').ok_or(AuthError::ApiKeyMalformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::ApiKeyMalformed);
    }
    parse_token(token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_valid_bearer() {
        let key = parse_bearer(Some("Bearer sk-abc123-s3cr3t-with-dashes")).unwrap();
        assert_eq!(key.prefix, "abc123");
        assert_eq!(key.token, "sk-abc123-s3cr3t-with-dashes");
        assert!(!format!("{key:?}").contains("s3cr3t"));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some("Basic sk-abc-def"))]
    #[case(Some("Bearer"))]
    #[case(Some("Bearer abc-def"))]
    #[case(Some("Bearer sk-abc"))]
    #[case(Some("Bearer sk--secret"))]
    #[case(Some("Bearer sk-abc-"))]
    #[case(Some("Bearer sk-a_b-secret"))]
    fn rejects_malformed(#[case] header: Option<&str>) {
        assert_eq!(parse_bearer(header), Err(AuthError::ApiKeyMalformed));
    }
}
