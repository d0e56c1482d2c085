//! # 上游协议适配器
//!
//! 公共协议（OpenAI 兼容）与各上游家族协议之间的双向翻译。

pub mod custom_http;
pub mod image;
pub mod normalize;
pub mod openai;
pub mod openai_compatible;
pub mod registry;
pub mod stream;
pub mod template;
pub mod traits;
pub mod types;

pub use custom_http::CustomHttpAdapter;
pub use image::ImageAdapter;
pub use openai::OpenAIAdapter;
pub use openai_compatible::OpenAICompatibleAdapter;
pub use registry::AdapterRegistry;
pub use traits::ProviderAdapter;
pub use types::{
    ByteStream, Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, StreamChunk,
    UpstreamBody, UpstreamRequest, UpstreamResponse, UpstreamStream,
};
