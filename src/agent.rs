//! Headless Agent 运行时
//!
//! 供 CLI / HTTP 调用的无界面入口：
//! create_agent_components 按配置构建 LLM、工具注册表、规划器适配层、编排引擎与会话管理器；
//! process_message 解析会话并对单条用户消息跑编排回合。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{
    failure_text, BookingRecord, Coordinates, DispatchError, EngineEvent, EngineSettings,
    OrchestrationEngine, Stage, TurnReply,
};
use crate::fleet::{AmbulanceBackend, InMemoryFleet, LocationBackend, StaticLocation};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::planner::PlannerAdapter;
use crate::session::{SessionId, SessionManager};
use crate::tools::{build_registry, ToolExecutor};

/// 预构建的 Agent 组件：编排引擎与会话管理器，可多会话共享
pub struct AgentComponents {
    pub engine: OrchestrationEngine,
    pub sessions: Arc<SessionManager>,
}

/// 按配置创建组件：LLM 后端由 [llm] 决定，车队为内存参考实现
pub fn create_agent_components(cfg: &AppConfig) -> AgentComponents {
    let llm = create_llm_from_config(&cfg.llm);
    let location = Arc::new(StaticLocation::new(cfg.location.fallback()));
    let fleet = Arc::new(InMemoryFleet::new(
        cfg.fleet.units.clone(),
        cfg.fleet.speed_kmph,
        cfg.fleet.max_distance_km,
    ));
    create_agent_components_with(cfg, llm, location, fleet)
}

/// 使用给定的 LLM 与后端创建组件（测试注入脚本化规划器与故障后端）
pub fn create_agent_components_with(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    location: Arc<dyn LocationBackend>,
    ambulances: Arc<dyn AmbulanceBackend>,
) -> AgentComponents {
    let registry = Arc::new(build_registry(
        &cfg.tools,
        cfg.location.area_table(),
        location,
        ambulances,
    ));
    let planner = PlannerAdapter::new(llm, Arc::clone(&registry), cfg.engine.planner_timeout());
    let engine = OrchestrationEngine::new(
        planner,
        ToolExecutor::new(registry),
        EngineSettings::from_config(&cfg.engine),
    );
    let sessions = Arc::new(SessionManager::from_config(
        &cfg.session,
        cfg.engine.max_tool_attempts,
    ));
    AgentComponents { engine, sessions }
}

/// 入站消息；session_id 为空时新建会话
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    pub session_id: Option<String>,
    pub text: String,
    /// 设备上报的位置
    pub location: Option<Coordinates>,
}

impl InboundMessage {
    pub fn new(session_id: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.map(String::from),
            text: text.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, at: Coordinates) -> Self {
        self.location = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundReply {
    pub session_id: SessionId,
    pub assistant_text: String,
    pub stage: Stage,
    pub booking: Option<BookingRecord>,
}

impl From<TurnReply> for OutboundReply {
    fn from(r: TurnReply) -> Self {
        Self {
            session_id: r.session_id,
            assistant_text: r.assistant_text,
            stage: r.stage,
            booking: r.booking,
        }
    }
}

/// 处理单条用户消息
pub async fn process_message(
    components: &AgentComponents,
    msg: InboundMessage,
) -> Result<OutboundReply, DispatchError> {
    run_message(components, msg, None).await
}

/// 处理单条用户消息，并通过 event_tx 推送回合 / 决策 / 工具 / 阶段事件
pub async fn process_message_stream(
    components: &AgentComponents,
    msg: InboundMessage,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
) -> Result<OutboundReply, DispatchError> {
    run_message(components, msg, Some(&event_tx)).await
}

async fn run_message(
    components: &AgentComponents,
    msg: InboundMessage,
    events: Option<&mpsc::UnboundedSender<EngineEvent>>,
) -> Result<OutboundReply, DispatchError> {
    let handle = components.sessions.resolve(msg.session_id.as_deref()).await?;
    match components
        .engine
        .run(&handle, &msg.text, msg.location, events)
        .await
    {
        Ok(reply) => Ok(reply.into()),
        Err(DispatchError::Cancelled) => {
            // 中止的会话仍在会话表中，已过期 / 删除的不在
            if components.sessions.get(handle.id()).await.is_err() {
                return Err(DispatchError::SessionExpired(handle.id().to_string()));
            }
            let session = handle.lock().await;
            let state = session.business.current();
            Ok(OutboundReply {
                session_id: session.id.clone(),
                assistant_text: failure_text(state.failure_reason().unwrap_or("cancelled")),
                stage: state.stage(),
                booking: state.booking().cloned(),
            })
        }
        Err(e) => Err(e),
    }
}
