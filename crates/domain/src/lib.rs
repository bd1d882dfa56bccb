//! 论坛实时子系统的领域模型
//!
//! 包含用户/连接标识、私信、在线状态等核心类型，以及核心依赖的外部存储接口。

pub mod errors;
pub mod message;
pub mod presence;
pub mod repository;
pub mod session;
pub mod value_objects;

pub use errors::{DomainError, RepositoryError};
pub use message::{Message, NewMessage};
pub use presence::{PresenceState, PresenceStatus};
pub use repository::{
    MessageRepository, PresenceRepository, RepositoryFuture, RepositoryResult, SessionRepository,
};
pub use session::Session;
pub use value_objects::{ConnectionId, MessageContent, MessageId, Timestamp, UserId};

#[cfg(feature = "testing")]
pub use repository::{MockMessageRepository, MockPresenceRepository, MockSessionRepository};
