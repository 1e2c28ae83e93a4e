//! 编排过程事件：用于 SSE / CLI 展示回合、规划决策、工具调用与阶段变化

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::Stage;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 新回合开始（turn 为会话内累计回合号）
    TurnStarted { turn: u32, budget: u32 },
    /// 规划器决策：tool_call / final_answer / clarify
    PlannerDecision { turn: u32, decision: String },
    /// 规划器提议被拒绝，纠正提示已注入下一轮
    CorrectionIssued { turn: u32, kind: String, hint: String },
    ToolDispatched { turn: u32, tool: String, attempt: u32 },
    ToolRetry {
        turn: u32,
        tool: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    ToolFinished {
        turn: u32,
        tool: String,
        ok: bool,
        detail: String,
    },
    StageChanged { from: Stage, to: Stage },
    /// 会话到达终态（Booked / Failed）
    Terminal { stage: Stage, reason: Option<String> },
}

pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

pub(crate) fn send_event(tx: Option<&EventSink>, ev: EngineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
