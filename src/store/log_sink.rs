//! 默认请求日志接收端：写一条 tracing 事件

use async_trait::async_trait;

use super::traits::RequestLogSink;
use super::types::RequestLogRecord;
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl RequestLogSink for TracingLogSink {
    async fn emit(&self, record: RequestLogRecord) -> Result<()> {
        let usage = record.usage.unwrap_or_default();
        tracing::info!(
            target: "model_gateway::request_log",
            request_id = %record.request_id,
            trace_id = %record.trace_id,
            tenant_id = record.tenant_id.as_deref().unwrap_or("-"),
            api_key_id = record.api_key_id.as_deref().unwrap_or("-"),
            endpoint = %record.endpoint,
            virtual_model = record.virtual_model.as_deref().unwrap_or("-"),
            upstream_id = record.upstream_id.as_deref().unwrap_or("-"),
            upstream_model = record.upstream_model.as_deref().unwrap_or("-"),
            status = record.status,
            stream = record.stream,
            duration_ms = record.duration_ms,
            ttfb_ms = record.ttfb_ms.unwrap_or(0),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            error_type = record.error_type.as_deref().unwrap_or("-"),
            "请求完成"
        );
        Ok(())
    }
}

/// 收集日志记录，测试用
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    records: std::sync::Mutex<Vec<RequestLogRecord>>,
}

#[cfg(any(test, feature = "testing"))]
impl CollectingLogSink {
    pub fn records(&self) -> Vec<RequestLogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl RequestLogSink for CollectingLogSink {
    async fn emit(&self, record: RequestLogRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}
