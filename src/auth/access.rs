//! # 访问控制
//!
//! key 的模型与端点白名单，支持 `*` 通配；白名单为空表示全部允许。

use super::types::AuthContext;
use crate::error::AuthError;
use crate::store::Endpoint;

/// `*` 匹配任意长度字符
#[must_use]
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while vi < v.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if pi < p.len() && p[pi] == v[vi] {
            pi += 1;
            vi += 1;
        } else if let Some((sp, sv)) = star {
            pi = sp + 1;
            vi = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

fn allowed(patterns: &[String], candidates: &[&str]) -> bool {
    patterns.is_empty()
        || patterns
            .iter()
            .any(|p| candidates.iter().any(|c| wildcard_match(p, c)))
}

/// 端点可以用名称（`chat_completions`）或路径（`/v1/chat/completions`）配置
pub fn check_access(
    auth: &AuthContext,
    endpoint: Endpoint,
    model: Option<&str>,
) -> Result<(), AuthError> {
    if !allowed(&auth.allowed_endpoints, &[endpoint.as_str(), endpoint.path()]) {
        return Err(AuthError::EndpointNotAllowed {
            endpoint: endpoint.path().to_string(),
        });
    }
    if let Some(model) = model {
        if !allowed(&auth.allowed_models, &[model]) {
            return Err(AuthError::ModelNotAllowed {
                model: model.to_string(),
            });
        }
    }
    Ok(())
}

/// 模型列表过滤
#[must_use]
pub fn model_allowed(auth: &AuthContext, model: &str) -> bool {
    allowed(&auth.allowed_models, &[model])
}
