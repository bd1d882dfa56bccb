//! 把领域事件翻译成出站帧和投递目标

use std::sync::Arc;

use domain::{ConnectionId, Message, PresenceStatus, Timestamp, UserId};
use thiserror::Error;

use crate::connection::ConnectionHandle;
use crate::protocol::{
    MessageAckPayload, MessagePayload, MessageReadPayload, PresenceEntry,
    PresenceSnapshotPayload, ServerFrame, StatusUpdatePayload, TypingPayload,
};
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 决定在线状态变化通知给谁
pub trait PresenceAudience: Send + Sync {
    fn audience(&self, subject: UserId, registry: &Registry) -> Vec<UserId>;
}

/// 默认拓扑：通知除本人以外的所有在线用户
#[derive(Debug, Default)]
pub struct AllConnectedUsers;

impl PresenceAudience for AllConnectedUsers {
    fn audience(&self, subject: UserId, registry: &Registry) -> Vec<UserId> {
        registry.users().filter(|user| *user != subject).collect()
    }
}

/// 单个投递目标：某用户的全部连接，可跳过其中一条
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user_id: UserId,
    pub skip: Option<ConnectionId>,
    pub payload: Arc<str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub targets: Vec<Target>,
}

impl Delivery {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Clone)]
pub struct Relay {
    audience: Arc<dyn PresenceAudience>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(Arc::new(AllConnectedUsers))
    }
}

impl Relay {
    pub fn new(audience: Arc<dyn PresenceAudience>) -> Self {
        Self { audience }
    }

    /// 新消息：接收者的全部连接，加上发送者除来源连接外的其他连接
    pub fn chat(
        &self,
        message: &Message,
        origin: &ConnectionHandle,
        temp_id: Option<&str>,
    ) -> Result<Delivery, RelayError> {
        let payload = |is_owner| {
            ServerFrame::Message(MessagePayload {
                id: message.id,
                sender_id: message.sender_id,
                recipient_id: message.recipient_id,
                content: message.content.as_str().to_owned(),
                created_at: message.created_at,
                is_read: message.is_read,
                temp_id: temp_id.map(str::to_owned),
                sender_username: origin.username().to_owned(),
                is_owner,
            })
            .encode()
        };

        Ok(Delivery {
            targets: vec![
                Target {
                    user_id: message.sender_id,
                    skip: Some(origin.id()),
                    payload: payload(true)?,
                },
                Target {
                    user_id: message.recipient_id,
                    skip: None,
                    payload: payload(false)?,
                },
            ],
        })
    }

    /// 直接回给来源连接的确认
    pub fn message_ack(
        &self,
        message: &Message,
        temp_id: Option<&str>,
    ) -> Result<Arc<str>, RelayError> {
        Ok(ServerFrame::MessageAck(MessageAckPayload {
            id: message.id,
            temp_id: temp_id.map(str::to_owned),
            created_at: message.created_at,
        })
        .encode()?)
    }

    pub fn typing(
        &self,
        sender: UserId,
        recipient: UserId,
        is_typing: bool,
    ) -> Result<Delivery, RelayError> {
        let payload = ServerFrame::Typing(TypingPayload {
            sender_id: sender,
            is_typing,
        })
        .encode()?;
        Ok(Delivery {
            targets: vec![Target {
                user_id: recipient,
                skip: None,
                payload,
            }],
        })
    }

    /// 通知原发送者的全部连接：`reader` 已读了 `count` 条
    pub fn read_receipt(
        &self,
        reader: UserId,
        sender: UserId,
        count: u64,
        read_at: Timestamp,
    ) -> Result<Delivery, RelayError> {
        let payload = ServerFrame::MessageRead(MessageReadPayload {
            reader_id: reader,
            count,
            read_at,
        })
        .encode()?;
        Ok(Delivery {
            targets: vec![Target {
                user_id: sender,
                skip: None,
                payload,
            }],
        })
    }

    /// 在线状态变化，目标在调用时刻由注册表计算
    pub fn presence(
        &self,
        subject: UserId,
        status: PresenceStatus,
        at: Timestamp,
        registry: &Registry,
    ) -> Result<Delivery, RelayError> {
        let payload = ServerFrame::StatusUpdate(StatusUpdatePayload {
            user_id: subject,
            status,
            timestamp: at,
        })
        .encode()?;
        let targets = self
            .audience
            .audience(subject, registry)
            .into_iter()
            .map(|user_id| Target {
                user_id,
                skip: None,
                payload: payload.clone(),
            })
            .collect();
        Ok(Delivery { targets })
    }

    /// 除 `viewer` 外的在线用户列表
    pub fn presence_snapshot(
        &self,
        viewer: UserId,
        registry: &Registry,
    ) -> Result<Arc<str>, RelayError> {
        let users = registry
            .snapshot()
            .into_iter()
            .filter(|user| user.user_id != viewer)
            .map(|user| PresenceEntry {
                user_id: user.user_id,
                status: user.status,
            })
            .collect();
        Ok(ServerFrame::PresenceSnapshot(PresenceSnapshotPayload { users }).encode()?)
    }

    pub fn pong(&self) -> Result<Arc<str>, RelayError> {
        Ok(ServerFrame::Pong.encode()?)
    }
}
