//! 在线状态的持久化与查询
//!
//! 调度器从不等待存储：状态变化交给 [`PresenceRecorder`] 后台任务按顺序写入。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use domain::{PresenceRepository, PresenceState, PresenceStatus, Timestamp, UserId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::DispatcherHandle;
use crate::error::ApplicationError;
use crate::registry::OnlineUser;

/// 一次需要持久化的状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub at: Timestamp,
}

/// 积压每增加这么多条记录一次告警
const BACKLOG_WARN_STEP: usize = 1024;

/// 单一写入者，按调度器产生的顺序落库
///
/// 队列不设上限，调度器不能因存储变慢而阻塞；积压只随连接和断开的次数增长，
/// 存储停滞时按 [`BACKLOG_WARN_STEP`] 告警。
#[derive(Debug, Clone)]
pub struct PresenceRecorder {
    tx: mpsc::UnboundedSender<PresenceChange>,
    backlog: Arc<AtomicUsize>,
}

impl PresenceRecorder {
    /// 启动后台写入任务，所有句柄被丢弃后任务在写完剩余变化后退出
    pub fn spawn(store: Arc<dyn PresenceRepository>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PresenceChange>();
        let backlog = Arc::new(AtomicUsize::new(0));
        let pending = backlog.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if let Err(err) = store
                    .set_status(change.user_id, change.status, change.at)
                    .await
                {
                    tracing::warn!(
                        user_id = %change.user_id,
                        status = %change.status,
                        error = %err,
                        "在线状态持久化失败"
                    );
                }
                pending.fetch_sub(1, Ordering::Relaxed);
            }
            tracing::debug!("在线状态写入任务结束");
        });
        (Self { tx, backlog }, task)
    }

    pub fn record(&self, change: PresenceChange) {
        let backlog = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog % BACKLOG_WARN_STEP == 0 {
            tracing::warn!(backlog, "在线状态写入积压");
        }
        if let Err(err) = self.tx.send(change) {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(user_id = %err.0.user_id, "在线状态写入任务已停止，丢弃状态变化");
        }
    }

    /// 已提交但尚未写完的状态变化数量
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

/// HTTP 查询返回的单用户状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_active: Option<Timestamp>,
    /// 当前是否有实时连接
    pub connected: bool,
}

/// 在线状态只读查询
#[derive(Clone)]
pub struct PresenceService {
    dispatcher: DispatcherHandle,
    store: Arc<dyn PresenceRepository>,
}

impl PresenceService {
    pub fn new(dispatcher: DispatcherHandle, store: Arc<dyn PresenceRepository>) -> Self {
        Self { dispatcher, store }
    }

    pub async fn online(&self) -> Result<Vec<OnlineUser>, ApplicationError> {
        self.dispatcher.snapshot().await
    }

    /// 优先使用实时状态，其次是持久化状态，都没有则视为离线
    pub async fn status_of(&self, user_id: UserId) -> Result<PresenceView, ApplicationError> {
        let live = self
            .dispatcher
            .snapshot()
            .await?
            .into_iter()
            .find(|user| user.user_id == user_id);

        let stored: Option<PresenceState> = match self.store.get_status(user_id).await {
            Ok(state) => state,
            Err(err) if live.is_some() => {
                tracing::warn!(user_id = %user_id, error = %err, "读取持久化在线状态失败");
                None
            }
            Err(err) => return Err(err.into()),
        };
        let last_active = stored.as_ref().map(|state| state.last_active);

        let view = match (live, stored) {
            (Some(live), _) => PresenceView {
                user_id,
                status: live.status,
                last_active,
                connected: true,
            },
            (None, Some(state)) => PresenceView {
                user_id,
                status: state.status,
                last_active,
                connected: false,
            },
            (None, None) => PresenceView {
                user_id,
                status: PresenceStatus::Offline,
                last_active: None,
                connected: false,
            },
        };
        Ok(view)
    }
}
