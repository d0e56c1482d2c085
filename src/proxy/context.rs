//! # 请求上下文
//!
//! `RouteContext` 在路由完成后构建，请求生命周期内只读，不会被持久化。

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::store::Endpoint;

/// 解密后的上游凭证；Debug 输出被遮蔽，且不实现序列化
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// 上游鉴权（凭证已解密）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAuth {
    None,
    Bearer(Secret),
    Header { name: String, value: Secret },
}

impl ResolvedAuth {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer(_) => "bearer",
            Self::Header { .. } => "header",
        }
    }
}

/// 单个请求的路由上下文
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub api_key_id: String,
    pub endpoint: Endpoint,
    pub virtual_model: String,
    pub stream: bool,
    pub upstream_id: String,
    /// 发往上游的模型名
    pub upstream_model: String,
    pub base_url: String,
    /// 适配器类型键
    pub adapter: String,
    pub auth: ResolvedAuth,
    /// 注入到上游请求的额外请求头
    pub headers: BTreeMap<String, String>,
    pub model_override: Option<String>,
    pub timeout: Duration,
    /// 适配器私有配置
    pub extras: Value,
}

impl RouteContext {
    /// 读取 extras 中的字符串配置
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(Value::as_str)
    }
}
