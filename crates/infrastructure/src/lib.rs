//! 基础设施层实现。
//!
//! 基于 PostgreSQL 的私信、在线状态和会话仓储，实现领域层定义的存储接口。

pub mod migrations;
pub mod repository;

pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgMessageRepository, PgPresenceRepository, PgSessionRepository, PgStorage,
};
