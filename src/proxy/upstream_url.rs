//! 上游地址拼接工具
//!
//! `base_url` 可能缺少 scheme，也可能已经带有 `/v1` 这样的前缀路径。

use url::Url;

use crate::error::AdapterError;

type Result<T> = std::result::Result<T, AdapterError>;

/// 规范化 `base_url`，缺省 scheme 时补 https
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AdapterError::configuration("upstream base_url is empty"));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&with_scheme)
        .map_err(|e| AdapterError::configuration(format!("upstream base_url is invalid: {e}")))
}

/// 拼接 `base_url` 与相对路径；`base_url` 以 `/v1` 结尾时去掉路径中重复的 `/v1`
pub fn join_upstream_url(base_url: &str, path: &str) -> Result<String> {
    let base = parse_base_url(base_url)?;
    let (path, query) = path.split_once('?').map_or((path, None), |(p, q)| (p, Some(q)));
    let base_path = base.path().trim_end_matches('/');
    let path = if base_path.ends_with("/v1") {
        path.strip_prefix("/v1").unwrap_or(path)
    } else {
        path
    };
    let mut joined = base.clone();
    joined.set_path(&format!("{base_path}{path}"));
    if query.is_some() {
        joined.set_query(query);
    }
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://api.openai.com", "/v1/chat/completions", "https://api.openai.com/v1/chat/completions")]
    #[case("https://api.openai.com/v1", "/v1/embeddings", "https://api.openai.com/v1/embeddings")]
    #[case("https://api.openai.com/v1/", "/v1/embeddings", "https://api.openai.com/v1/embeddings")]
    #[case("localhost:8000", "/v1/models", "https://localhost:8000/v1/models")]
    #[case("http://10.0.0.1:7860/", "/sdapi/v1/txt2img", "http://10.0.0.1:7860/sdapi/v1/txt2img")]
    #[case("http://tgi.internal", "/generate?details=true", "http://tgi.internal/generate?details=true")]
    fn joins_paths(#[case] base: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(join_upstream_url(base, path).unwrap(), expected);
    }

    #[test]
    fn empty_base_is_configuration_error() {
        assert!(join_upstream_url(" ", "/v1/x").is_err());
    }
}
