//! # 上游选择
//!
//! 先剔除熔断器为 OPEN 的候选，再在剩余候选中按权重选择。
//! 权重为 0 的候选只有在没有正权重候选时才会被选中。

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::circuit_breaker::CircuitState;
use super::types::{SchedulingStrategy, WeightedUpstream};
use crate::error::{GatewayError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 上游选择器
#[derive(Debug, Default)]
pub struct UpstreamSelector {
    strategy: SchedulingStrategy,
    /// 轮询计数，按候选集合分组
    counters: DashMap<String, Arc<AtomicUsize>>,
}

impl UpstreamSelector {
    #[must_use]
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self {
            strategy,
            counters: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// 从候选中选出一个上游，返回其在 `candidates` 中的下标
    pub fn select(&self, request_id: &str, candidates: &[WeightedUpstream]) -> Result<usize> {
        let available: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.circuit_state != CircuitState::Open)
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return Err(GatewayError::no_healthy_upstream(
                "All upstreams for this model are currently unavailable",
            ));
        }

        let weighted: Vec<usize> = available
            .iter()
            .copied()
            .filter(|&i| candidates[i].weight > 0)
            .collect();
        let pool = if weighted.is_empty() { &available } else { &weighted };

        let chosen = match self.strategy {
            SchedulingStrategy::WeightedRandom => pick_weighted(candidates, pool),
            SchedulingStrategy::RoundRobin => self.pick_round_robin(candidates, pool),
        };

        ldebug!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Scheduler,
            "upstream_selected",
            "上游选择完成",
            strategy = self.strategy.as_str(),
            upstream_id = candidates[chosen].id(),
            available = available.len(),
            total = candidates.len()
        );
        Ok(chosen)
    }

    fn pick_round_robin(&self, candidates: &[WeightedUpstream], pool: &[usize]) -> usize {
        let group = pool
            .iter()
            .map(|&i| candidates[i].id())
            .collect::<Vec<_>>()
            .join(",");
        let counter = self
            .counters
            .entry(group)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        pool[counter.fetch_add(1, Ordering::Relaxed) % pool.len()]
    }
}

/// 按权重随机；池中全为 0 权重时均匀随机
fn pick_weighted(candidates: &[WeightedUpstream], pool: &[usize]) -> usize {
    if pool.len() == 1 {
        return pool[0];
    }
    let total: u64 = pool.iter().map(|&i| u64::from(candidates[i].weight)).sum();
    if total == 0 {
        return pool[fastrand::usize(..pool.len())];
    }
    let mut point = fastrand::u64(..total);
    for &i in pool {
        let weight = u64::from(candidates[i].weight);
        if point < weight {
            return i;
        }
        point -= weight;
    }
    pool[pool.len() - 1]
}
