//! 出站请求安全

pub mod ssrf;

pub use ssrf::{Resolver, SsrfGuard, StaticResolver, SystemResolver};
