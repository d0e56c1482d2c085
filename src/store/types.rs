//! 数据面从控制面读取的记录类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 公共 API 端点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    ImagesEdits,
    ImagesVariations,
    AudioSpeech,
    AudioTranscriptions,
    AudioTranslations,
    Rerank,
}

impl Endpoint {
    pub const ALL: [Self; 10] = [
        Self::ChatCompletions,
        Self::Completions,
        Self::Embeddings,
        Self::ImagesGenerations,
        Self::ImagesEdits,
        Self::ImagesVariations,
        Self::AudioSpeech,
        Self::AudioTranscriptions,
        Self::AudioTranslations,
        Self::Rerank,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::ImagesGenerations => "images_generations",
            Self::ImagesEdits => "images_edits",
            Self::ImagesVariations => "images_variations",
            Self::AudioSpeech => "audio_speech",
            Self::AudioTranscriptions => "audio_transcriptions",
            Self::AudioTranslations => "audio_translations",
            Self::Rerank => "rerank",
        }
    }

    /// 公共路径（同时也是 OpenAI 风格上游的相对路径）
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Completions => "/v1/completions",
            Self::Embeddings => "/v1/embeddings",
            Self::ImagesGenerations => "/v1/images/generations",
            Self::ImagesEdits => "/v1/images/edits",
            Self::ImagesVariations => "/v1/images/variations",
            Self::AudioSpeech => "/v1/audio/speech",
            Self::AudioTranscriptions => "/v1/audio/transcriptions",
            Self::AudioTranslations => "/v1/audio/translations",
            Self::Rerank => "/v1/rerank",
        }
    }

    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.path() == path)
    }

    /// 请求体为 multipart 表单
    #[must_use]
    pub const fn is_multipart(self) -> bool {
        matches!(
            self,
            Self::ImagesEdits
                | Self::ImagesVariations
                | Self::AudioTranscriptions
                | Self::AudioTranslations
        )
    }

    /// 响应可能是二进制
    #[must_use]
    pub const fn is_binary_response(self) -> bool {
        matches!(self, Self::AudioSpeech)
    }

    /// 响应体 `object` 字段缺省值
    #[must_use]
    pub const fn default_object(self) -> Option<&'static str> {
        match self {
            Self::ChatCompletions => Some("chat.completion"),
            Self::Completions => Some("text_completion"),
            Self::Embeddings => Some("list"),
            Self::Rerank => Some("rerank"),
            _ => None,
        }
    }

    /// 响应是否带 token 用量
    #[must_use]
    pub const fn reports_usage(self) -> bool {
        matches!(
            self,
            Self::ChatCompletions | Self::Completions | Self::Embeddings | Self::Rerank
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按窗口计数的速率限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

const fn default_window_seconds() -> u64 {
    60
}

/// 周期性 token 预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub token_budget: u64,
    #[serde(default = "default_quota_period")]
    pub period_seconds: u64,
}

const fn default_quota_period() -> u64 {
    86_400
}

/// API key 记录，`key_hash` 是完整 token 的 bcrypt 哈希
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub prefix: String,
    pub key_hash: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
    #[serde(default)]
    pub log_payloads: bool,
}

const fn default_true() -> bool {
    true
}

/// 上游鉴权方式
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamAuth {
    #[default]
    None,
    Bearer {
        credential: String,
    },
    Header {
        name: String,
        credential: String,
    },
}

impl UpstreamAuth {
    /// 不透明凭证引用
    #[must_use]
    pub fn credential_ref(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Bearer { credential } | Self::Header { credential, .. } => Some(credential),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer { .. } => "bearer",
            Self::Header { .. } => "header",
        }
    }
}

/// 上游配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,
    /// 适配器类型键：openai / openai_compatible / image / custom_http
    pub adapter: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: UpstreamAuth,
    /// 注入到上游请求的额外请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 适配器私有配置（流格式、模板等）
    #[serde(default)]
    pub extras: serde_json::Value,
}

/// 路由目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub upstream_id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 上游模型名，缺省沿用虚拟模型名
    #[serde(default)]
    pub model: Option<String>,
}

const fn default_weight() -> u32 {
    1
}

/// 租户路由：(端点, 虚拟模型) -> 加权上游集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub tenant_id: String,
    /// 精确名称，或以 `*` 结尾的前缀模式
    pub virtual_model: String,
    /// 为空表示所有端点
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 覆盖所有目标的上游模型名
    #[serde(default)]
    pub model_override: Option<String>,
    pub targets: Vec<RouteTarget>,
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// 从 OpenAI 风格 `usage` 对象提取
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let get = |k: &str| obj.get(k).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let prompt = get("prompt_tokens");
        let completion = get("completion_tokens");
        let total = obj
            .get("total_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(prompt + completion);
        Some(Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        })
    }
}

/// 每个请求一条的结构化日志记录
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: Option<String>,
    pub api_key_id: Option<String>,
    pub endpoint: String,
    pub virtual_model: Option<String>,
    pub upstream_id: Option<String>,
    pub upstream_model: Option<String>,
    pub status: u16,
    pub stream: bool,
    pub duration_ms: u64,
    pub ttfb_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub error_type: Option<String>,
    /// 仅在 key 的日志策略允许时携带
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}
