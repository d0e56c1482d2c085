//! # 适配器特征定义
//!
//! 每个上游家族一个实现。实现必须无状态，同一实例会被并发请求共享。

use super::types::{
    Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, UpstreamRequest,
    UpstreamResponse, UpstreamStream,
};
use crate::proxy::RouteContext;

/// 上游协议适配器
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// 适配器类型键，与上游配置中的 `adapter` 字段对应
    fn name(&self) -> &'static str;

    fn supports(&self, capability: Capability) -> bool;

    /// 公共请求 -> 上游请求
    fn build_upstream_request(
        &self,
        body: PublicBody,
        ctx: &RouteContext,
    ) -> ProviderResult<UpstreamRequest>;

    /// 上游响应 -> 公共响应；4xx/5xx 转为 `AdapterError`
    fn parse_upstream_response(
        &self,
        raw: UpstreamResponse,
        ctx: &RouteContext,
    ) -> ProviderResult<PublicResponse>;

    /// 上游字节流 -> 公共分片序列
    fn stream_translate(&self, raw: UpstreamStream, ctx: &RouteContext) -> ChunkStream;
}
