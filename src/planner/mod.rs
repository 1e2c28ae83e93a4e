//! 规划器：LLM 决策的解析与边界校验

pub mod adapter;
pub mod parse;

pub use adapter::{
    build_system_prompt, PlannerAction, PlannerAdapter, ValidatedCall, FALLBACK_QUESTION,
    SNAPSHOT_PREFIX,
};
pub use parse::{decision_schema_json, parse_llm_output, RawDecision};
