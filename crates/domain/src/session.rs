use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 认证协作方解析出的会话身份。
///
/// `username` 即发送者展示信息，在建立连接时获取一次。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
}

impl Session {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}
