//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use message::{recent_window, Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};

use crate::config::{LlmProvider, LlmSection};

/// 按配置创建 LLM 客户端；openai 但没有 API key 时退回 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider {
        LlmProvider::Mock => Arc::new(MockLlmClient),
        LlmProvider::OpenAi => {
            let key = cfg
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.trim().is_empty());
            match key {
                Some(key) => Arc::new(OpenAiClient::new(
                    cfg.base_url.as_deref(),
                    &cfg.model,
                    Some(&key),
                )),
                None => {
                    tracing::warn!("no API key configured, falling back to mock planner");
                    Arc::new(MockLlmClient)
                }
            }
        }
    }
}
