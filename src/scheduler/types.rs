//! # 路由调度类型定义

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::circuit_breaker::CircuitState;
use crate::store::UpstreamConfig;

/// 选择策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// 按权重随机
    #[default]
    WeightedRandom,
    /// 按候选顺序轮询（权重为 0 的跳过）
    RoundRobin,
}

impl SchedulingStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WeightedRandom => "weighted_random",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// 策略匹配产出的候选上游
#[derive(Debug, Clone)]
pub struct WeightedUpstream {
    pub upstream: Arc<UpstreamConfig>,
    pub weight: u32,
    /// 匹配时的熔断状态快照
    pub circuit_state: CircuitState,
    /// 虚拟模型映射到的上游模型名
    pub upstream_model: String,
    pub model_override: Option<String>,
    /// 路由级超时
    pub timeout_ms: Option<u64>,
}

impl WeightedUpstream {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.upstream.id
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.upstream.base_url
    }
}
