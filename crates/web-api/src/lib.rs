//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 升级入口、连接生命周期循环以及在线状态查询接口。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{extract_token, Claims, JwtService, SESSION_COOKIE};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
