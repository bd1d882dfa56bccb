//! 应用层实现。
//!
//! 实时子系统的核心：线协议、连接句柄、注册表、调度器、
//! 事件中继、入站处理以及在线状态的持久化。

pub mod clock;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;

pub use clock::{Clock, SystemClock};
pub use connection::{CloseReason, ConnectionHandle, Outbound, OutboundQueue, PushError};
pub use dispatcher::{Command, Dispatcher, DispatcherHandle, DispatcherSettings};
pub use error::ApplicationError;
pub use hub::{RealtimeDependencies, RealtimeHub};
pub use ingest::{InboundHandler, IngestOutcome};
pub use presence::{PresenceChange, PresenceRecorder, PresenceService, PresenceView};
pub use protocol::{decode_frame, ClientFrame, FrameError, InboundCommand, ServerFrame};
pub use registry::{OnlineUser, Registry, Removal};
pub use relay::{AllConnectedUsers, Delivery, PresenceAudience, Relay, RelayError, Target};
