//! 适配器注册表：按上游配置中的 `adapter` 键查找实现

use std::collections::HashMap;
use std::sync::Arc;

use super::custom_http::CustomHttpAdapter;
use super::image::ImageAdapter;
use super::openai::OpenAIAdapter;
use super::openai_compatible::OpenAICompatibleAdapter;
use super::traits::ProviderAdapter;
use super::types::ProviderResult;
use crate::error::AdapterError;

/// 适配器注册表，启动后只读
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// 注册内置的四类适配器
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(OpenAIAdapter));
        registry.register(Arc::new(OpenAICompatibleAdapter));
        registry.register(Arc::new(ImageAdapter));
        registry.register(Arc::new(CustomHttpAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, name: &str) -> ProviderResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::configuration(format!("unknown adapter '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
