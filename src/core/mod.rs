//! 核心编排层：错误与恢复、业务状态、执行追踪、过程事件、编排引擎

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod tracker;

pub use error::{DispatchError, RecoveryAction};
pub use events::{EngineEvent, EventSink};
pub use orchestrator::{failure_text, EngineSettings, OrchestrationEngine, TurnReply};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use state::{
    Ambulance, BookingRecord, BusinessState, BusinessStateStore, Coordinates, ProposedTransition,
    Stage, StageChange, Transition,
};
pub use tracker::{
    ExecutionTracker, InvocationId, InvocationStatus, RequestIdentity, ToolInvocation,
};
