//! LLM provider layer: the `LlmProvider` capability, an OpenAI-compatible
//! HTTP client, and the multi-provider failover pool with quota tracking.

pub mod http_provider;
pub mod pool;
pub mod traits;

pub use http_provider::HttpProvider;
pub use pool::{ProviderPool, ProviderQuota};
pub use traits::{ChatOptions, LlmProvider, StreamEvent};
