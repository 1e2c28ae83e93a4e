//! 业务状态：一次急救会话已确立的现实事实（位置、候选车辆、预约记录）
//!
//! BusinessState 沿 Init -> LocationKnown -> CandidatesFound -> Booked 单调前进，Failed 可从任意非终态进入；
//! Booked 与 Failed 均为终态且只写一次。BusinessStateStore 以乐观并发（源阶段必须与当前阶段一致）应用迁移，
//! 并保证同一 (session, turn) 的迁移至多应用一次。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::DispatchError;
use crate::tools::{BOOK_AMBULANCE, FIND_AMBULANCES, GET_LOCATION};

/// 经纬度坐标
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// 纬度 [-90, 90]、经度 [-180, 180] 且为有限数
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// 查找工具返回的候选救护车；返回后不可变，新一次查找整体替换旧列表
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ambulance {
    pub id: String,
    pub distance_km: f64,
    pub eta_min: u32,
    pub available: bool,
}

/// 预约记录：每个会话只创建一次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub booking_id: String,
    pub ambulance_id: String,
    pub confirmed: bool,
    pub booked_at: DateTime<Utc>,
}

/// 业务阶段标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    LocationKnown,
    CandidatesFound,
    Booked,
    Failed,
}

impl Stage {
    /// 在主链 Init < LocationKnown < CandidatesFound < Booked 上的序号；Failed 不在链上
    pub fn rank(self) -> Option<u8> {
        match self {
            Stage::Init => Some(0),
            Stage::LocationKnown => Some(1),
            Stage::CandidatesFound => Some(2),
            Stage::Booked => Some(3),
            Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Booked | Stage::Failed)
    }

    /// 当前阶段允许派发的工具
    pub fn allowed_tools(self) -> &'static [&'static str] {
        match self {
            Stage::Init => &[GET_LOCATION],
            Stage::LocationKnown => &[GET_LOCATION, FIND_AMBULANCES],
            Stage::CandidatesFound => &[FIND_AMBULANCES, BOOK_AMBULANCE],
            Stage::Booked | Stage::Failed => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::LocationKnown => "location_known",
            Stage::CandidatesFound => "candidates_found",
            Stage::Booked => "booked",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话业务状态（带数据的阶段）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum BusinessState {
    Init,
    LocationKnown {
        location: Coordinates,
    },
    CandidatesFound {
        location: Coordinates,
        candidates: Vec<Ambulance>,
    },
    Booked {
        location: Coordinates,
        candidates: Vec<Ambulance>,
        booking: BookingRecord,
    },
    Failed {
        reason: String,
    },
}

impl BusinessState {
    pub fn stage(&self) -> Stage {
        match self {
            BusinessState::Init => Stage::Init,
            BusinessState::LocationKnown { .. } => Stage::LocationKnown,
            BusinessState::CandidatesFound { .. } => Stage::CandidatesFound,
            BusinessState::Booked { .. } => Stage::Booked,
            BusinessState::Failed { .. } => Stage::Failed,
        }
    }

    pub fn location(&self) -> Option<Coordinates> {
        match self {
            BusinessState::LocationKnown { location }
            | BusinessState::CandidatesFound { location, .. }
            | BusinessState::Booked { location, .. } => Some(*location),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[Ambulance] {
        match self {
            BusinessState::CandidatesFound { candidates, .. }
            | BusinessState::Booked { candidates, .. } => candidates,
            _ => &[],
        }
    }

    pub fn booking(&self) -> Option<&BookingRecord> {
        match self {
            BusinessState::Booked { booking, .. } => Some(booking),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            BusinessState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// 由工具输出推导出的业务迁移
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    LocationAcquired { location: Coordinates },
    CandidatesListed { candidates: Vec<Ambulance> },
    BookingConfirmed { booking: BookingRecord },
}

impl Transition {
    fn tool_name(&self) -> &'static str {
        match self {
            Transition::LocationAcquired { .. } => GET_LOCATION,
            Transition::CandidatesListed { .. } => FIND_AMBULANCES,
            Transition::BookingConfirmed { .. } => BOOK_AMBULANCE,
        }
    }
}

/// 提议的迁移：turn 为产生该迁移的回合号，expected 为提议时观察到的阶段
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedTransition {
    pub turn: u32,
    pub expected: Stage,
    pub transition: Transition,
}

/// 阶段变化历史（审计用）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    /// None 表示系统触发（预算耗尽、过期、取消）
    pub turn: Option<u32>,
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/// 单会话业务状态存储：乐观并发 + 回合去重 + 终态只写一次
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusinessStateStore {
    current: BusinessState,
    applied_turns: BTreeSet<u32>,
    history: Vec<StageChange>,
}

impl Default for BusinessStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BusinessStateStore {
    pub fn new() -> Self {
        Self {
            current: BusinessState::Init,
            applied_turns: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> &BusinessState {
        &self.current
    }

    pub fn stage(&self) -> Stage {
        self.current.stage()
    }

    pub fn history(&self) -> &[StageChange] {
        &self.history
    }

    /// 应用迁移；源阶段不一致返回 StaleTransition，同一回合重复返回 TransitionReplayed
    pub fn apply(&mut self, proposal: ProposedTransition) -> Result<&BusinessState, DispatchError> {
        let ProposedTransition {
            turn,
            expected,
            transition,
        } = proposal;

        if self.applied_turns.contains(&turn) {
            return Err(DispatchError::TransitionReplayed { turn });
        }
        let actual = self.current.stage();
        if actual != expected {
            return Err(DispatchError::StaleTransition { expected, actual });
        }
        if actual.is_terminal() {
            return Err(DispatchError::TerminalState(actual));
        }

        let tool = transition.tool_name();
        let next = match (&self.current, transition) {
            (
                BusinessState::Init | BusinessState::LocationKnown { .. },
                Transition::LocationAcquired { location },
            ) => {
                if !location.is_valid() {
                    return Err(illegal(tool, actual, "coordinates out of range"));
                }
                BusinessState::LocationKnown { location }
            }
            (
                BusinessState::LocationKnown { location }
                | BusinessState::CandidatesFound { location, .. },
                Transition::CandidatesListed { candidates },
            ) => BusinessState::CandidatesFound {
                location: *location,
                candidates,
            },
            (
                BusinessState::CandidatesFound {
                    location,
                    candidates,
                },
                Transition::BookingConfirmed { booking },
            ) => {
                if !candidates.iter().any(|c| c.id == booking.ambulance_id) {
                    return Err(illegal(
                        tool,
                        actual,
                        "booked ambulance is not among the current candidates",
                    ));
                }
                if !booking.confirmed {
                    return Err(illegal(tool, actual, "booking was not confirmed"));
                }
                BusinessState::Booked {
                    location: *location,
                    candidates: candidates.clone(),
                    booking,
                }
            }
            (_, _) => return Err(illegal(tool, actual, "stage cannot be skipped or reversed")),
        };

        self.applied_turns.insert(turn);
        self.record(Some(turn), actual, next.stage());
        self.current = next;
        Ok(&self.current)
    }

    /// 直接进入 Failed（预算耗尽、过期、取消、致命工具失败）；终态不可覆盖
    pub fn force_fail(&mut self, reason: impl Into<String>) -> Result<(), DispatchError> {
        let actual = self.current.stage();
        if actual.is_terminal() {
            return Err(DispatchError::TerminalState(actual));
        }
        self.record(None, actual, Stage::Failed);
        self.current = BusinessState::Failed {
            reason: reason.into(),
        };
        Ok(())
    }

    fn record(&mut self, turn: Option<u32>, from: Stage, to: Stage) {
        self.history.push(StageChange {
            turn,
            from,
            to,
            at: Utc::now(),
        });
    }
}

fn illegal(tool: &str, stage: Stage, detail: &str) -> DispatchError {
    DispatchError::IllegalTransition {
        tool: tool.to_string(),
        stage,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn here() -> Coordinates {
        Coordinates::new(12.9335, 77.6105)
    }

    fn unit(id: &str) -> Ambulance {
        Ambulance {
            id: id.to_string(),
            distance_km: 0.5,
            eta_min: 1,
            available: true,
        }
    }

    fn booking(ambulance_id: &str) -> BookingRecord {
        BookingRecord {
            booking_id: "bk-1".to_string(),
            ambulance_id: ambulance_id.to_string(),
            confirmed: true,
            booked_at: Utc::now(),
        }
    }

    fn propose(turn: u32, expected: Stage, transition: Transition) -> ProposedTransition {
        ProposedTransition {
            turn,
            expected,
            transition,
        }
    }

    fn store_with_candidates() -> BusinessStateStore {
        let mut store = BusinessStateStore::new();
        store
            .apply(propose(1, Stage::Init, Transition::LocationAcquired { location: here() }))
            .unwrap();
        store
            .apply(propose(
                2,
                Stage::LocationKnown,
                Transition::CandidatesListed {
                    candidates: vec![unit("amb-1"), unit("amb-2")],
                },
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_full_forward_chain() {
        let mut store = store_with_candidates();
        store
            .apply(propose(
                3,
                Stage::CandidatesFound,
                Transition::BookingConfirmed {
                    booking: booking("amb-2"),
                },
            ))
            .unwrap();
        assert_eq!(store.stage(), Stage::Booked);
        let ranks: Vec<_> = store.history().iter().map(|c| c.to.rank()).collect();
        assert_eq!(ranks, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_cannot_skip_location() {
        let mut store = BusinessStateStore::new();
        let err = store
            .apply(propose(
                1,
                Stage::Init,
                Transition::CandidatesListed {
                    candidates: vec![unit("amb-1")],
                },
            ))
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { .. }));
        assert_eq!(store.stage(), Stage::Init);
    }

    #[test]
    fn test_stale_source_stage_is_rejected() {
        let mut store = store_with_candidates();
        let err = store
            .apply(propose(
                3,
                Stage::LocationKnown,
                Transition::CandidatesListed { candidates: vec![] },
            ))
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::StaleTransition {
                expected: Stage::LocationKnown,
                actual: Stage::CandidatesFound,
            }
        );
    }

    #[test]
    fn test_same_turn_is_never_applied_twice() {
        let mut store = BusinessStateStore::new();
        store
            .apply(propose(1, Stage::Init, Transition::LocationAcquired { location: here() }))
            .unwrap();
        let err = store
            .apply(propose(
                1,
                Stage::LocationKnown,
                Transition::LocationAcquired { location: here() },
            ))
            .unwrap_err();
        assert_eq!(err, DispatchError::TransitionReplayed { turn: 1 });
    }

    #[test]
    fn test_new_lookup_replaces_candidates() {
        let mut store = store_with_candidates();
        store
            .apply(propose(
                3,
                Stage::CandidatesFound,
                Transition::CandidatesListed {
                    candidates: vec![unit("amb-9")],
                },
            ))
            .unwrap();
        let ids: Vec<_> = store.current().candidates().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["amb-9"]);
    }

    #[test]
    fn test_location_cannot_regress_after_candidates() {
        let mut store = store_with_candidates();
        let err = store
            .apply(propose(
                3,
                Stage::CandidatesFound,
                Transition::LocationAcquired { location: here() },
            ))
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { .. }));
    }

    #[test]
    fn test_booking_must_target_a_candidate() {
        let mut store = store_with_candidates();
        let err = store
            .apply(propose(
                3,
                Stage::CandidatesFound,
                Transition::BookingConfirmed {
                    booking: booking("amb-404"),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { .. }));
        assert_eq!(store.stage(), Stage::CandidatesFound);
    }

    #[test]
    fn test_booked_is_write_once() {
        let mut store = store_with_candidates();
        store
            .apply(propose(
                3,
                Stage::CandidatesFound,
                Transition::BookingConfirmed {
                    booking: booking("amb-1"),
                },
            ))
            .unwrap();
        let err = store
            .apply(propose(
                4,
                Stage::Booked,
                Transition::BookingConfirmed {
                    booking: booking("amb-2"),
                },
            ))
            .unwrap_err();
        assert_eq!(err, DispatchError::TerminalState(Stage::Booked));
        assert_eq!(store.force_fail("expired"), Err(DispatchError::TerminalState(Stage::Booked)));
        assert_eq!(store.current().booking().map(|b| b.ambulance_id.as_str()), Some("amb-1"));
    }

    #[test]
    fn test_failed_is_reachable_from_any_stage_and_terminal() {
        let mut store = store_with_candidates();
        store.force_fail("turn_budget_exhausted").unwrap();
        assert_eq!(store.current().failure_reason(), Some("turn_budget_exhausted"));
        assert!(store.force_fail("expired").is_err());
        assert_eq!(store.current().failure_reason(), Some("turn_budget_exhausted"));
    }

    #[test]
    fn test_invalid_coordinates_rejected() {
        let mut store = BusinessStateStore::new();
        let err = store
            .apply(propose(
                1,
                Stage::Init,
                Transition::LocationAcquired {
                    location: Coordinates::new(123.0, 0.0),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalTransition { .. }));
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let store = store_with_candidates();
        let json = serde_json::to_string(&store).unwrap();
        let back: BusinessStateStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current(), store.current());
        assert_eq!(back.history(), store.history());
    }
}
