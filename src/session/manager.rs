//! 会话生命周期管理
//!
//! 进程级会话表（tokio RwLock），显式生命周期：启动时创建，按 TTL 过期回收，只通过管理器访问。
//! 每个会话一把 FIFO 互斥锁串行化编排回合；过期 / 中止通过取消令牌打断进行中的回合，
//! 再在拿到锁后关闭未终结的调用并写入 Failed(reason)。
//! 摘要另存一份在 watch 通道里，列表 / 查询摘要不等待会话锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{SessionSection, UnknownSessionPolicy};
use crate::core::{Coordinates, DispatchError};
use crate::session::{new_session_id, Session, SessionId, SessionSummary};

/// 会话句柄：取消令牌 + 会话锁 + 最近一次发布的摘要
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    inner: Mutex<Session>,
    summary: watch::Sender<SessionSummary>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        let (summary, _) = watch::channel(session.summary());
        Self {
            id: session.id.clone(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(session),
            summary,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 获取会话锁；并发消息按到达顺序排队
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().await
    }

    /// 不排队：回合进行中返回 None
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Session>> {
        self.inner.try_lock().ok()
    }

    /// 持锁方在阶段变化与回合结束时调用
    pub fn publish(&self, session: &Session) {
        self.summary.send_replace(session.summary());
    }

    /// 最近一次发布的摘要；回合进行中也立即返回
    pub fn summary(&self) -> SessionSummary {
        self.summary.borrow().clone()
    }

    /// 打断进行中的回合，拿到锁后关闭未终结调用并写入 Failed(reason)
    async fn terminate(&self, reason: &str) -> SessionSummary {
        self.cancel.cancel();
        let mut session = self.inner.lock().await;
        self.fail_locked(&mut session, reason)
    }

    fn fail_locked(&self, session: &mut Session, reason: &str) -> SessionSummary {
        let closed = session.execution.close_open("cancelled");
        if session.business.force_fail(reason).is_ok() {
            tracing::info!(session = %self.id, reason, closed, "session failed");
        }
        session.touch();
        self.publish(session);
        session.summary()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    ttl: Duration,
    policy: UnknownSessionPolicy,
    max_tool_attempts: u32,
}

impl SessionManager {
    pub fn new(ttl: Duration, policy: UnknownSessionPolicy, max_tool_attempts: u32) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            policy,
            max_tool_attempts,
        }
    }

    pub fn from_config(cfg: &SessionSection, max_tool_attempts: u32) -> Self {
        Self::new(
            Duration::from_secs(cfg.ttl_secs),
            cfg.unknown_session,
            max_tool_attempts,
        )
    }

    pub async fn create(&self) -> Arc<SessionHandle> {
        let session = Session::new(new_session_id(), self.max_tool_attempts);
        let handle = Arc::new(SessionHandle::new(session));
        self.sessions
            .write()
            .await
            .insert(handle.id.clone(), Arc::clone(&handle));
        tracing::info!(session = %handle.id, "session created");
        handle
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>, DispatchError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::SessionNotFound(id.to_string()))
    }

    /// 消息入口的会话解析：无 ID 新建；未知 / 已过期 ID 按策略拒绝或新建
    pub async fn resolve(&self, id: Option<&str>) -> Result<Arc<SessionHandle>, DispatchError> {
        let Some(id) = id.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(self.create().await);
        };
        match self.get(id).await {
            Ok(handle) => Ok(handle),
            Err(e) => match self.policy {
                UnknownSessionPolicy::Reject => Err(e),
                UnknownSessionPolicy::Create => {
                    tracing::info!(requested = %id, "unknown session, starting a fresh one");
                    Ok(self.create().await)
                }
            },
        }
    }

    /// 回收会话：移出会话表，非终态会话写入 Failed("expired")
    pub async fn expire(&self, id: &str) -> Result<SessionSummary, DispatchError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DispatchError::SessionNotFound(id.to_string()))?;
        let reason = DispatchError::SessionExpired(id.to_string());
        Ok(handle.terminate(reason.failure_reason()).await)
    }

    /// 回收所有空闲超过 TTL 的会话；正在处理回合的会话（锁被占用）不算空闲
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut expired = 0;
        for handle in handles {
            if self.expire_if_idle(&handle, now, ttl).await {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "idle sessions reclaimed");
        }
        expired
    }

    /// 空闲判断、移出会话表与写入 Failed 都在同一次持锁内完成，
    /// 判断之后开始的回合不会被误回收
    async fn expire_if_idle(
        &self,
        handle: &Arc<SessionHandle>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> bool {
        let Ok(mut session) = handle.inner.try_lock() else {
            return false;
        };
        if !session.is_idle(now, ttl) {
            return false;
        }
        {
            let mut sessions = self.sessions.write().await;
            let registered = sessions
                .get(&handle.id)
                .is_some_and(|current| Arc::ptr_eq(current, handle));
            if !registered {
                return false;
            }
            sessions.remove(&handle.id);
        }
        handle.cancel.cancel();
        let reason = DispatchError::SessionExpired(handle.id.clone());
        handle.fail_locked(&mut session, reason.failure_reason());
        true
    }

    /// 用户中止：打断进行中的回合，会话进入 Failed("cancelled")，仍保留在会话表中
    pub async fn abort(&self, id: &str) -> Result<SessionSummary, DispatchError> {
        let handle = self.get(id).await?;
        Ok(handle.terminate(DispatchError::Cancelled.failure_reason()).await)
    }

    /// 删除会话（打断进行中的回合）
    pub async fn remove(&self, id: &str) -> Result<(), DispatchError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DispatchError::SessionNotFound(id.to_string()))?;
        handle.cancel.cancel();
        tracing::info!(session = %id, "session removed");
        Ok(())
    }

    pub async fn summary(&self, id: &str) -> Result<SessionSummary, DispatchError> {
        Ok(self.get(id).await?.summary())
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(|h| h.summary())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// 更新设备上报的位置，供下一次 get_location 使用；坐标合法性由调用方校验
    pub async fn set_device_location(
        &self,
        id: &str,
        at: Coordinates,
    ) -> Result<SessionSummary, DispatchError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        session.device_location = Some(at);
        session.touch();
        handle.publish(&session);
        tracing::info!(session = %id, lat = at.lat, lon = at.lon, "device location updated");
        Ok(session.summary())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 导出全部会话（持久化用）
    pub async fn export(&self) -> Vec<Session> {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out
    }

    /// 导入会话；已存在的 ID 保持不变，返回导入数量
    pub async fn restore(&self, sessions: Vec<Session>) -> usize {
        let mut map = self.sessions.write().await;
        let mut restored = 0;
        for session in sessions {
            if map.contains_key(&session.id) {
                continue;
            }
            map.insert(session.id.clone(), Arc::new(SessionHandle::new(session)));
            restored += 1;
        }
        restored
    }

    /// 后台清理任务：每 interval 回收空闲会话，shutdown 取消时退出
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired(Utc::now()).await;
                    }
                }
            }
            tracing::debug!("session sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    fn manager(policy: UnknownSessionPolicy) -> SessionManager {
        SessionManager::new(Duration::from_secs(1800), policy, 3)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        assert!(h.id().starts_with("session_"));
        assert_eq!(m.get(h.id()).await.unwrap().id(), h.id());
        assert_eq!(m.active_count().await, 1);
        assert_eq!(
            m.get("nope").await.unwrap_err(),
            DispatchError::SessionNotFound("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_expire_fails_non_terminal_session() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        let summary = m.expire(h.id()).await.unwrap();
        assert_eq!(summary.stage, Stage::Failed);
        assert_eq!(summary.failure_reason.as_deref(), Some("expired"));
        assert!(h.is_cancelled());
        assert!(matches!(
            m.resolve(Some(h.id())).await,
            Err(DispatchError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_policy_starts_fresh_session() {
        let m = manager(UnknownSessionPolicy::Create);
        let h = m.create().await;
        let old = h.id().to_string();
        m.expire(&old).await.unwrap();
        let fresh = m.resolve(Some(&old)).await.unwrap();
        assert_ne!(fresh.id(), old);
        assert_eq!(fresh.lock().await.stage(), Stage::Init);
    }

    #[tokio::test]
    async fn test_sweep_only_reclaims_idle_sessions() {
        let m = manager(UnknownSessionPolicy::Reject);
        let idle = m.create().await;
        let fresh = m.create().await;
        idle.lock().await.last_activity = Utc::now() - chrono::Duration::hours(1);

        assert_eq!(m.sweep_expired(Utc::now()).await, 1);
        assert!(m.get(idle.id()).await.is_err());
        assert!(m.get(fresh.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_skips_session_with_turn_in_flight() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        let mut guard = h.lock().await;
        guard.last_activity = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(m.sweep_expired(Utc::now()).await, 0);
        drop(guard);
        assert_eq!(m.sweep_expired(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_rechecks_idleness_under_the_lock() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        h.lock().await.last_activity = Utc::now() - chrono::Duration::hours(1);

        // 回合在清理前抢到锁并刷新了活跃时间
        let mut turn = h.lock().await;
        assert_eq!(m.sweep_expired(Utc::now()).await, 0);
        turn.touch();
        drop(turn);

        assert_eq!(m.sweep_expired(Utc::now()).await, 0);
        assert_eq!(h.lock().await.stage(), Stage::Init);
        assert!(!h.is_cancelled());
        assert!(m.get(h.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_does_not_wait_for_session_lock() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        let mut turn = h.lock().await;
        turn.turns = 2;
        h.publish(&turn);

        let listed = tokio::time::timeout(Duration::from_secs(1), m.list())
            .await
            .unwrap();
        assert_eq!(listed[0].turns, 2);
        assert_eq!(m.summary(h.id()).await.unwrap().turns, 2);
        drop(turn);
    }

    #[tokio::test]
    async fn test_set_device_location() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        m.set_device_location(h.id(), Coordinates::new(12.97, 77.59))
            .await
            .unwrap();
        assert_eq!(
            h.lock().await.device_location,
            Some(Coordinates::new(12.97, 77.59))
        );
        assert!(matches!(
            m.set_device_location("nope", Coordinates::new(0.0, 0.0)).await,
            Err(DispatchError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_keeps_session_listed() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        let summary = m.abort(h.id()).await.unwrap();
        assert_eq!(summary.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(m.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_export_restore() {
        let m = manager(UnknownSessionPolicy::Reject);
        let h = m.create().await;
        let exported = m.export().await;
        let other = manager(UnknownSessionPolicy::Reject);
        assert_eq!(other.restore(exported.clone()).await, 1);
        assert_eq!(other.restore(exported).await, 0);
        assert!(other.get(h.id()).await.is_ok());
    }
}
