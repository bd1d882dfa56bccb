//! 单条实时连接的句柄
//!
//! 句柄可以廉价克隆，由注册表持有。真正的套接字由传输层的写任务独占，
//! 其他组件只能通过有界出站队列向它投递。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use domain::{ConnectionId, Session, Timestamp, UserId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 写任务消费的出站条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
}

pub type OutboundQueue = mpsc::Receiver<Outbound>;

/// 连接关闭原因，对应 WebSocket 关闭码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    IdleTimeout,
    /// 写失败或出站队列已满
    SlowConsumer,
    /// 单会话策略下被同一用户的新连接顶掉
    Superseded,
    Shutdown,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed => 1000,
            CloseReason::ReadError => 1011,
            CloseReason::IdleTimeout => 1001,
            CloseReason::SlowConsumer => 1008,
            CloseReason::Superseded => 4000,
            CloseReason::Shutdown => 1001,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::ReadError => "read error",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Superseded => "superseded",
            CloseReason::Shutdown => "server shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

#[derive(Debug)]
struct Inner {
    id: ConnectionId,
    user_id: UserId,
    username: String,
    created_at: Timestamp,
    opened: Instant,
    /// 相对 `opened` 的毫秒数
    last_activity_ms: AtomicU64,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// 创建连接句柄，返回写任务需要消费的出站队列
    pub fn new(session: &Session, created_at: Timestamp, buffer: usize) -> (Self, OutboundQueue) {
        let (outbound, queue) = mpsc::channel(buffer.max(1));
        let handle = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::generate(),
                user_id: session.user_id,
                username: session.username.clone(),
                created_at,
                opened: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                outbound,
                shutdown: CancellationToken::new(),
                close_reason: OnceLock::new(),
            }),
        };
        (handle, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn created_at(&self) -> Timestamp {
        self.inner.created_at
    }

    /// 非阻塞投递，永远不会等待
    pub fn try_push(&self, item: Outbound) -> Result<(), PushError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.inner.outbound.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// 关闭连接，只有第一次调用的原因会被记录
    pub fn close(&self, reason: CloseReason) {
        let _ = self.inner.close_reason.set(reason);
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().copied()
    }

    /// 收到任意入站帧时刷新活跃时间
    pub fn touch(&self) {
        let elapsed = self.inner.opened.elapsed().as_millis() as u64;
        self.inner
            .last_activity_ms
            .fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.opened
            + Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed))
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}
