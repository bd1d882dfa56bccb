//! 核心依赖的外部存储接口
//!
//! 实时子系统不拥有表结构，只调用这里声明的操作。

use futures::future::BoxFuture;

use crate::errors::RepositoryError;
use crate::message::{Message, NewMessage};
use crate::presence::{PresenceState, PresenceStatus};
use crate::session::Session;
use crate::value_objects::{Timestamp, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type RepositoryFuture<T> = BoxFuture<'static, RepositoryResult<T>>;

/// 只追加的私信日志
#[cfg_attr(feature = "testing", mockall::automock)]
pub trait MessageRepository: Send + Sync {
    /// 持久化消息并返回带有存储分配标识的记录
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message>;

    /// 将 `sender` 发给 `recipient` 的未读消息批量标记为已读，返回受影响条数
    fn mark_read(&self, sender: UserId, recipient: UserId) -> RepositoryFuture<u64>;
}

/// 持久化的在线状态
#[cfg_attr(feature = "testing", mockall::automock)]
pub trait PresenceRepository: Send + Sync {
    fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> RepositoryFuture<()>;

    fn get_status(&self, user_id: UserId) -> RepositoryFuture<Option<PresenceState>>;
}

/// 认证协作方：凭据 -> 用户身份
#[cfg_attr(feature = "testing", mockall::automock)]
pub trait SessionRepository: Send + Sync {
    fn resolve(&self, token: &str) -> RepositoryFuture<Option<Session>>;
}
