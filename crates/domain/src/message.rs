use serde::{Deserialize, Serialize};

use crate::value_objects::{MessageContent, MessageId, Timestamp, UserId};

/// 尚未持久化的私信，还没有标识。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
}

/// 已持久化的私信。
///
/// 只有 `is_read` 会在之后被回执修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
    pub is_read: bool,
}

impl Message {
    /// 由存储在分配标识后构造
    pub fn persisted(id: MessageId, message: NewMessage) -> Self {
        Self {
            id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            created_at: message.created_at,
            is_read: false,
        }
    }
}
