//! Siren - 急救调度智能体编排核心
//!
//! 由 LLM 规划器驱动，按 定位 → 查找救护车 → 预约 的业务链推进会话。
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（供 CLI / HTTP 调用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、业务状态、执行追踪、编排引擎
//! - **fleet**: 定位与车队后端抽象、内存参考实现
//! - **http**: axum HTTP 接入层（需 `web` feature）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **planner**: 规划器适配层（提示词、输出解析与校验）
//! - **session**: 会话生命周期、空闲回收与快照持久化
//! - **tools**: 工具注册表、执行器与急救工具

pub mod agent;
pub mod config;
pub mod core;
pub mod fleet;
#[cfg(feature = "web")]
pub mod http;
pub mod llm;
pub mod observability;
pub mod planner;
pub mod session;
pub mod tools;
