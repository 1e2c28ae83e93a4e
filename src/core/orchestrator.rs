//! 编排引擎：单会话回合状态机
//!
//! AwaitingPlanner -> Validating -> Dispatching -> AwaitingTool -> Updating -> (AwaitingPlanner | Terminal)
//!
//! - 规划器追问（Clarify）直接返回用户，不触碰业务状态
//! - 不合法的工具调用作为纠正提示反馈给规划器，消耗一个回合而不派发
//! - 幂等工具的瞬时失败按指数退避重试；EffectOnce 工具失败直接进入 Failed，绝不静默重试预约
//! - StaleTransition 放弃本回合并重新询问规划器
//! - 业务状态到达 Booked / Failed，或回合预算耗尽（Failed("turn_budget_exhausted")）时终止
//!
//! 整个回合在会话锁内执行；取消（用户中止、会话过期）打断进行中的调用，
//! 被打断的调用记为 Failed("cancelled")，业务状态由取消方写入。

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::core::events::send_event;
use crate::core::{
    Ambulance, BookingRecord, BusinessState, Coordinates, DispatchError, EngineEvent, EventSink,
    InvocationStatus, ProposedTransition, RecoveryAction, RecoveryEngine, RetryPolicy, Stage,
    Transition,
};
use crate::llm::{recent_window, Message};
use crate::planner::{PlannerAction, PlannerAdapter, ValidatedCall};
use crate::session::{Session, SessionHandle, SessionId, SessionSnapshot};
use crate::tools::ambulance::booking_key;
use crate::tools::{
    FieldSource, IdempotencyClass, ToolContext, ToolExecutor, ToolOutcome, ToolSpec,
    BOOK_AMBULANCE, FIND_AMBULANCES, GET_LOCATION,
};

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub turn_budget: u32,
    pub max_corrections: u32,
    pub retry: RetryPolicy,
    pub history_window: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineSection::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &EngineSection) -> Self {
        Self {
            turn_budget: cfg.turn_budget,
            max_corrections: cfg.max_corrections,
            retry: cfg.retry_policy(),
            history_window: cfg.history_window.max(1),
        }
    }
}

/// 一条用户消息处理完毕后的回复
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub session_id: SessionId,
    pub assistant_text: String,
    pub stage: Stage,
    pub booking: Option<BookingRecord>,
}

enum Step {
    Continue,
    Reply(String),
}

pub struct OrchestrationEngine {
    planner: PlannerAdapter,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    settings: EngineSettings,
}

impl OrchestrationEngine {
    pub fn new(planner: PlannerAdapter, executor: ToolExecutor, settings: EngineSettings) -> Self {
        Self {
            planner,
            executor,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    /// 处理一条用户消息：在会话锁内循环 规划 -> 校验 -> 派发 -> 更新，直到需要回复用户或到达终态。
    /// 只有取消会以 Err(Cancelled) 返回，其余失败都已转换为业务状态与回复文本。
    pub async fn run(
        &self,
        handle: &SessionHandle,
        user_text: &str,
        device_location: Option<Coordinates>,
        events: Option<&EventSink>,
    ) -> Result<TurnReply, DispatchError> {
        let mut session = handle.lock().await;
        let cancel = handle.cancel_token();
        session.touch();

        // 上一个回合的 future 被丢弃时可能留下未终结的调用
        let closed = session.execution.close_open("cancelled");
        if closed > 0 {
            tracing::warn!(session = %session.id, closed, "closed invocations left open by an interrupted turn");
        }

        match device_location {
            Some(at) if at.is_valid() => session.device_location = Some(at),
            Some(at) => tracing::warn!(session = %session.id, ?at, "ignoring invalid device location"),
            None => {}
        }

        session.transcript.push(Message::user(user_text));

        let mut hints: Vec<String> = Vec::new();
        let mut corrections = 0u32;

        let text = loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if session.stage().is_terminal() {
                break terminal_text(session.business.current());
            }
            if session.turns >= self.settings.turn_budget {
                let err = DispatchError::TurnBudgetExhausted(session.turns);
                self.fail_session(&mut session, err.failure_reason(), events);
                continue;
            }

            let snapshot = session.snapshot(self.settings.history_window, self.settings.turn_budget);
            let transcript = recent_window(&session.transcript, self.settings.history_window).to_vec();
            let action = match self.plan(&snapshot, &transcript, &hints, &cancel).await {
                Ok(action) => action,
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(err) => {
                    tracing::error!(session = %session.id, error = %err, "planner unavailable");
                    self.fail_session(&mut session, err.failure_reason(), events);
                    continue;
                }
            };

            session.turns += 1;
            let turn = session.turns;
            handle.publish(&session);
            send_event(
                events,
                EngineEvent::TurnStarted {
                    turn,
                    budget: self.settings.turn_budget,
                },
            );
            send_event(
                events,
                EngineEvent::PlannerDecision {
                    turn,
                    decision: action.label().to_string(),
                },
            );
            tracing::info!(session = %session.id, turn, decision = action.label(), stage = %session.stage(), "planner decision");

            let step = match action {
                PlannerAction::FinalAnswer(text) => Step::Reply(text),
                PlannerAction::Clarify {
                    question,
                    rejection: None,
                } => Step::Reply(question),
                PlannerAction::Clarify {
                    question,
                    rejection: Some(err),
                } => self.correct(&err, IdempotencyClass::Idempotent, question, turn, &mut hints, &mut corrections, events),
                PlannerAction::ToolCall(call) => {
                    match self.execute_call(&mut session, turn, &call, &cancel, events).await {
                        Ok(_) => Step::Continue,
                        Err(err) => {
                            let class = self
                                .executor
                                .spec(&call.tool)
                                .map(|s| s.idempotency)
                                .unwrap_or(IdempotencyClass::Idempotent);
                            match self.recovery.handle(&err, class) {
                                RecoveryAction::RetryWithPrompt(_) => self.correct(
                                    &err,
                                    class,
                                    crate::planner::FALLBACK_QUESTION.to_string(),
                                    turn,
                                    &mut hints,
                                    &mut corrections,
                                    events,
                                ),
                                RecoveryAction::RestartTurn | RecoveryAction::Ignore => {
                                    tracing::debug!(session = %session.id, turn, error = %err, "turn discarded");
                                    Step::Continue
                                }
                                // 幂等调用的重试已在派发内耗尽
                                RecoveryAction::RetryWithBackoff => {
                                    self.fail_session(&mut session, err.failure_reason(), events);
                                    Step::Continue
                                }
                                RecoveryAction::FailSession(reason) => {
                                    self.fail_session(&mut session, &reason, events);
                                    Step::Continue
                                }
                                RecoveryAction::Abort => match err {
                                    DispatchError::Cancelled => return Err(DispatchError::Cancelled),
                                    _ => Step::Continue,
                                },
                            }
                        }
                    }
                }
            };

            handle.publish(&session);
            if let Step::Reply(text) = step {
                break text;
            }
        };

        session.transcript.push(Message::assistant(text.clone()));
        session.touch();
        handle.publish(&session);

        let state = session.business.current();
        let stage = state.stage();
        if stage.is_terminal() {
            send_event(
                events,
                EngineEvent::Terminal {
                    stage,
                    reason: state.failure_reason().map(String::from),
                },
            );
        }
        Ok(TurnReply {
            session_id: session.id.clone(),
            assistant_text: text,
            stage,
            booking: state.booking().cloned(),
        })
    }

    /// Validating -> Dispatching -> AwaitingTool -> Updating，返回更新后的阶段
    pub async fn execute_call(
        &self,
        session: &mut Session,
        turn: u32,
        call: &ValidatedCall,
        cancel: &CancellationToken,
        events: Option<&EventSink>,
    ) -> Result<Stage, DispatchError> {
        let expected = session.stage();
        let (spec, input) = self.validate_call(session, call)?;
        let output = self
            .dispatch(session, turn, &spec, input.clone(), cancel, events)
            .await?;
        self.apply_output(session, turn, expected, &spec.name, &input, output, events)
    }

    /// 校验工具调用是否属于当前阶段的合法下一步，并注入引擎字段得到完整输入
    pub fn validate_call(
        &self,
        session: &Session,
        call: &ValidatedCall,
    ) -> Result<(ToolSpec, Value), DispatchError> {
        let stage = session.stage();
        if !stage.allowed_tools().contains(&call.tool.as_str()) {
            let allowed = stage.allowed_tools().join(", ");
            return Err(DispatchError::IllegalTransition {
                tool: call.tool.clone(),
                stage,
                detail: if allowed.is_empty() {
                    "no tools are allowed at this stage".to_string()
                } else {
                    format!("allowed tools: {allowed}")
                },
            });
        }

        let spec = self.executor.spec(&call.tool)?;
        spec.validate_planner_args(&call.args)?;
        let input = bind_input(session, &spec, &call.args)?;

        if spec.name == BOOK_AMBULANCE {
            let target = input.get("ambulance_id").and_then(Value::as_str).unwrap_or_default();
            let candidate = session
                .business
                .current()
                .candidates()
                .iter()
                .any(|c| c.id == target && c.available);
            if !candidate {
                return Err(DispatchError::IllegalTransition {
                    tool: spec.name.clone(),
                    stage,
                    detail: format!("ambulance '{target}' is not an available candidate"),
                });
            }
        }

        spec.validate_input(&input)?;
        Ok((spec, input))
    }

    /// 登记调用并执行，幂等工具的瞬时失败按退避重试；同一回合重入时复用已有调用
    pub async fn dispatch(
        &self,
        session: &mut Session,
        turn: u32,
        spec: &ToolSpec,
        input: Value,
        cancel: &CancellationToken,
        events: Option<&EventSink>,
    ) -> Result<Value, DispatchError> {
        let id = match session
            .execution
            .begin(turn, &spec.name, input.clone(), spec.idempotency)
        {
            Ok(id) => id,
            Err(err @ DispatchError::DuplicateInvocation { existing, .. }) => {
                match session.execution.get(existing).map(|inv| inv.status.clone()) {
                    Some(InvocationStatus::Succeeded { output }) => {
                        tracing::info!(session = %session.id, turn, tool = %spec.name, "re-entered finished invocation");
                        return Ok(output);
                    }
                    Some(InvocationStatus::Failed { .. }) | None => return Err(err),
                    Some(_) => existing,
                }
            }
            Err(err) => return Err(err),
        };

        let ctx = ToolContext {
            session_id: session.id.clone(),
            device_location: session.device_location,
            cancel: cancel.clone(),
        };

        loop {
            let attempt = session.execution.start_attempt(id)?;
            send_event(
                events,
                EngineEvent::ToolDispatched {
                    turn,
                    tool: spec.name.clone(),
                    attempt,
                },
            );
            let deadline = std::time::Instant::now() + spec.timeout;
            let outcome = self
                .executor
                .invoke(&spec.name, &ctx, input.clone(), deadline)
                .await;

            let failure = match outcome {
                ToolOutcome::Succeeded(output) => {
                    session.execution.complete(id, output.clone())?;
                    send_event(
                        events,
                        EngineEvent::ToolFinished {
                            turn,
                            tool: spec.name.clone(),
                            ok: true,
                            detail: format!("attempt {attempt}"),
                        },
                    );
                    return Ok(output);
                }
                ToolOutcome::TransientFailure(f) | ToolOutcome::FatalFailure(f) => f,
            };

            let err = failure.into_error(&spec.name);
            if err == DispatchError::Cancelled {
                session.execution.fail(id, "cancelled")?;
                return Err(err);
            }

            if session.execution.should_retry(id, &err) {
                let next_attempt = session.execution.mark_retrying(id)?;
                let delay = self.settings.retry.backoff(attempt);
                tracing::warn!(session = %session.id, turn, tool = %spec.name, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying tool");
                send_event(
                    events,
                    EngineEvent::ToolRetry {
                        turn,
                        tool: spec.name.clone(),
                        next_attempt,
                        delay_ms: delay.as_millis() as u64,
                    },
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        session.execution.fail(id, "cancelled")?;
                        return Err(DispatchError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            tracing::warn!(session = %session.id, turn, tool = %spec.name, attempt, error = %err, "tool failed");
            session.execution.fail(id, err.to_string())?;
            send_event(
                events,
                EngineEvent::ToolFinished {
                    turn,
                    tool: spec.name.clone(),
                    ok: false,
                    detail: err.to_string(),
                },
            );
            return Err(err);
        }
    }

    /// 把工具输出作为业务迁移应用到状态存储
    #[allow(clippy::too_many_arguments)]
    pub fn apply_output(
        &self,
        session: &mut Session,
        turn: u32,
        expected: Stage,
        tool: &str,
        input: &Value,
        output: Value,
        events: Option<&EventSink>,
    ) -> Result<Stage, DispatchError> {
        let transition = transition_from_output(tool, input, output)?;
        let from = session.stage();
        let to = session
            .business
            .apply(ProposedTransition {
                turn,
                expected,
                transition,
            })?
            .stage();
        if from != to {
            tracing::info!(session = %session.id, turn, %from, %to, "stage changed");
            send_event(events, EngineEvent::StageChanged { from, to });
        }
        Ok(to)
    }

    async fn plan(
        &self,
        snapshot: &SessionSnapshot,
        transcript: &[Message],
        hints: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlannerAction, DispatchError> {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                r = self.planner.next_action(snapshot, transcript, hints) => r,
            };
            match result {
                Ok(action) => return Ok(action),
                Err(err) if attempt < self.settings.retry.max_attempts => {
                    let delay = self.settings.retry.backoff(attempt);
                    tracing::warn!(session = %snapshot.session_id, attempt, error = %err, "planner call failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 把拒绝原因作为纠正提示注入下一轮；超过纠正次数时把兜底问题交给用户
    #[allow(clippy::too_many_arguments)]
    fn correct(
        &self,
        err: &DispatchError,
        class: IdempotencyClass,
        fallback: String,
        turn: u32,
        hints: &mut Vec<String>,
        corrections: &mut u32,
        events: Option<&EventSink>,
    ) -> Step {
        if *corrections >= self.settings.max_corrections {
            tracing::info!(turn, kind = err.kind(), "correction limit reached, asking the user");
            return Step::Reply(fallback);
        }
        *corrections += 1;
        let hint = match self.recovery.handle(err, class) {
            RecoveryAction::RetryWithPrompt(hint) => hint,
            _ => err.to_string(),
        };
        tracing::info!(turn, kind = err.kind(), "planner proposal rejected");
        send_event(
            events,
            EngineEvent::CorrectionIssued {
                turn,
                kind: err.kind().to_string(),
                hint: hint.clone(),
            },
        );
        hints.push(hint);
        Step::Continue
    }

    fn fail_session(&self, session: &mut Session, reason: &str, events: Option<&EventSink>) {
        let from = session.stage();
        if session.business.force_fail(reason).is_ok() {
            tracing::warn!(session = %session.id, %from, reason, "session failed");
            send_event(
                events,
                EngineEvent::StageChanged {
                    from,
                    to: Stage::Failed,
                },
            );
        }
    }
}

/// 规划器参数 + 引擎注入字段（会话 ID、幂等键、已知坐标）；规划器给出的同名值被覆盖
fn bind_input(session: &Session, spec: &ToolSpec, args: &Value) -> Result<Value, DispatchError> {
    let mut input = match args {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let location = session.business.current().location();
    for field in spec.fields.iter().filter(|f| f.source == FieldSource::Engine) {
        let value = match field.name {
            "session_id" => json!(session.id),
            "idempotency_key" => {
                let ambulance = args.get("ambulance_id").and_then(Value::as_str).unwrap_or_default();
                json!(booking_key(&session.id, ambulance))
            }
            "lat" | "lon" => {
                let at = location.ok_or_else(|| DispatchError::IllegalTransition {
                    tool: spec.name.clone(),
                    stage: session.stage(),
                    detail: "location is not known yet".to_string(),
                })?;
                json!(if field.name == "lat" { at.lat } else { at.lon })
            }
            other => {
                return Err(DispatchError::SchemaValidation {
                    tool: spec.name.clone(),
                    detail: format!("no engine binding for field '{other}'"),
                })
            }
        };
        input.insert(field.name.to_string(), value);
    }
    Ok(Value::Object(input))
}

/// 工具输出是业务迁移的唯一合法来源
fn transition_from_output(tool: &str, input: &Value, output: Value) -> Result<Transition, DispatchError> {
    let malformed = |detail: String| DispatchError::ToolBackendError {
        tool: tool.to_string(),
        detail,
        transient: false,
    };
    match tool {
        GET_LOCATION => {
            let location: Coordinates = serde_json::from_value(output)
                .map_err(|e| malformed(format!("malformed location: {e}")))?;
            Ok(Transition::LocationAcquired { location })
        }
        FIND_AMBULANCES => {
            let candidates: Vec<Ambulance> = serde_json::from_value(output)
                .map_err(|e| malformed(format!("malformed candidate list: {e}")))?;
            Ok(Transition::CandidatesListed { candidates })
        }
        BOOK_AMBULANCE => {
            let booking_id = output
                .get("booking_id")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("booking response has no booking_id".to_string()))?;
            let confirmed = output.get("confirmed").and_then(Value::as_bool).unwrap_or(false);
            if !confirmed {
                return Err(malformed("booking was not confirmed".to_string()));
            }
            Ok(Transition::BookingConfirmed {
                booking: BookingRecord {
                    booking_id: booking_id.to_string(),
                    ambulance_id: input
                        .get("ambulance_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    confirmed,
                    booked_at: chrono::Utc::now(),
                },
            })
        }
        other => Err(DispatchError::UnknownTool(other.to_string())),
    }
}

/// 终态的确定性回复
fn terminal_text(state: &BusinessState) -> String {
    match state {
        BusinessState::Booked {
            booking,
            candidates,
            ..
        } => {
            let eta = candidates
                .iter()
                .find(|c| c.id == booking.ambulance_id)
                .map(|c| format!(" It should reach you in about {} min.", c.eta_min))
                .unwrap_or_default();
            format!(
                "Ambulance {} has been booked (booking {}).{eta} Stay where you are and keep your phone nearby.",
                booking.ambulance_id, booking.booking_id
            )
        }
        BusinessState::Failed { reason } => failure_text(reason),
        other => format!("Session is at stage {}.", other.stage()),
    }
}

/// Failed(reason) 对应的用户可读说明
pub fn failure_text(reason: &str) -> String {
    let detail = match reason {
        "turn_budget_exhausted" => "I could not finish arranging an ambulance in this conversation.",
        "expired" => "This conversation expired before an ambulance was booked.",
        "cancelled" => "This request was cancelled.",
        "planner_unavailable" => "The dispatch assistant is not responding right now.",
        "tool_timeout" | "tool_backend_error" => "The dispatch service could not complete the request.",
        _ => "Something went wrong while arranging an ambulance.",
    };
    format!("{detail} If this is an emergency, call your local emergency number now.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::Coordinates;
    use crate::fleet::{InMemoryFleet, StaticLocation};
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{build_registry, ToolRegistry};

    fn engine() -> OrchestrationEngine {
        let registry: Arc<ToolRegistry> = Arc::new(build_registry(
            &Default::default(),
            Default::default(),
            Arc::new(StaticLocation::new(Coordinates::new(12.9335, 77.6105))),
            Arc::new(InMemoryFleet::seeded()),
        ));
        let llm = Arc::new(ScriptedLlmClient::repeating(r#"{"action":"clarify","question":"?"}"#));
        let planner = PlannerAdapter::new(llm, Arc::clone(&registry), std::time::Duration::from_secs(1));
        OrchestrationEngine::new(planner, ToolExecutor::new(registry), EngineSettings::default())
    }

    fn call(tool: &str, args: Value) -> ValidatedCall {
        ValidatedCall {
            tool: tool.to_string(),
            args,
        }
    }

    #[test]
    fn test_booking_rejected_before_candidates() {
        let e = engine();
        let s = Session::new("s-1".to_string(), 3);
        let err = e
            .validate_call(&s, &call(BOOK_AMBULANCE, json!({"ambulance_id": "amb-1"})))
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { stage: Stage::Init, .. }));
    }

    #[tokio::test]
    async fn test_engine_fields_are_injected() {
        let e = engine();
        let mut s = Session::new("s-1".to_string(), 3);
        let cancel = CancellationToken::new();
        e.execute_call(&mut s, 1, &call(GET_LOCATION, json!({})), &cancel, None)
            .await
            .unwrap();
        let (_, input) = e
            .validate_call(&s, &call(FIND_AMBULANCES, json!({"lat": 0.0})))
            .unwrap();
        assert_eq!(input, json!({"lat": 12.9335, "lon": 77.6105}));

        e.execute_call(&mut s, 2, &call(FIND_AMBULANCES, json!({})), &cancel, None)
            .await
            .unwrap();
        let (_, input) = e
            .validate_call(&s, &call(BOOK_AMBULANCE, json!({"ambulance_id": "amb-2"})))
            .unwrap();
        assert_eq!(input["session_id"], json!("s-1"));
        assert_eq!(input["idempotency_key"], json!("book:s-1:amb-2"));
    }

    #[tokio::test]
    async fn test_booking_must_name_available_candidate() {
        let e = engine();
        let mut s = Session::new("s-1".to_string(), 3);
        let cancel = CancellationToken::new();
        e.execute_call(&mut s, 1, &call(GET_LOCATION, json!({})), &cancel, None)
            .await
            .unwrap();
        e.execute_call(&mut s, 2, &call(FIND_AMBULANCES, json!({})), &cancel, None)
            .await
            .unwrap();
        let err = e
            .validate_call(&s, &call(BOOK_AMBULANCE, json!({"ambulance_id": "amb-3"})))
            .unwrap_err();
        assert!(err.to_string().contains("amb-3"));
    }

    #[test]
    fn test_malformed_outputs_are_fatal_backend_errors() {
        let err = transition_from_output(GET_LOCATION, &json!({}), json!({"lat": "x"})).unwrap_err();
        assert!(!err.is_transient());
        let err = transition_from_output(
            BOOK_AMBULANCE,
            &json!({"ambulance_id": "amb-1"}),
            json!({"booking_id": "bk-1", "confirmed": false}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not confirmed"));
    }

    #[test]
    fn test_failure_text_is_plain_language() {
        assert!(failure_text("turn_budget_exhausted").contains("emergency number"));
        assert!(failure_text("whatever").contains("emergency number"));
    }
}
