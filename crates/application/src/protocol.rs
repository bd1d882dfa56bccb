//! WebSocket 线协议
//!
//! 入站帧以 `kind` 字段区分类型，解码后在产生任何副作用之前先校验为 [`InboundCommand`]。
//! 出站帧统一为 `{"type": ..., "data": ...}`。

use std::sync::Arc;

use domain::{
    DomainError, MessageContent, MessageId, PresenceStatus, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 客户端发来的原始帧
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientFrame {
    Chat {
        recipient: Option<String>,
        content: Option<String>,
        #[serde(rename = "tempID", alias = "temp_id", default)]
        temp_id: Option<String>,
    },
    Typing {
        recipient: Option<String>,
    },
    TypingStop {
        recipient: Option<String>,
    },
    ReadAck {
        recipient: Option<String>,
    },
    Heartbeat,
    Pong,
    Status {
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// 校验通过的入站命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    Chat {
        recipient: UserId,
        content: MessageContent,
        temp_id: Option<String>,
    },
    Typing {
        recipient: UserId,
        is_typing: bool,
    },
    /// 读者确认已读 `sender` 发来的消息
    ReadAck {
        sender: UserId,
    },
    Heartbeat,
    Pong,
    Status(PresenceStatus),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown frame kind")]
    UnknownKind,
    #[error("invalid frame: {0}")]
    Invalid(#[from] DomainError),
}

/// 解析并校验一帧文本
pub fn decode_frame(text: &str) -> Result<InboundCommand, FrameError> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
    frame.validate()
}

fn required_user(field: &'static str, value: Option<String>) -> Result<UserId, DomainError> {
    let value = value.ok_or_else(|| DomainError::invalid_argument(field, "is required"))?;
    UserId::parse(&value)
}

impl ClientFrame {
    pub fn validate(self) -> Result<InboundCommand, FrameError> {
        let command = match self {
            ClientFrame::Chat {
                recipient,
                content,
                temp_id,
            } => InboundCommand::Chat {
                recipient: required_user("recipient", recipient)?,
                content: MessageContent::new(content.unwrap_or_default())?,
                temp_id,
            },
            ClientFrame::Typing { recipient } => InboundCommand::Typing {
                recipient: required_user("recipient", recipient)?,
                is_typing: true,
            },
            ClientFrame::TypingStop { recipient } => InboundCommand::Typing {
                recipient: required_user("recipient", recipient)?,
                is_typing: false,
            },
            ClientFrame::ReadAck { recipient } => InboundCommand::ReadAck {
                sender: required_user("recipient", recipient)?,
            },
            ClientFrame::Heartbeat => InboundCommand::Heartbeat,
            ClientFrame::Pong => InboundCommand::Pong,
            ClientFrame::Status { status } => {
                let status: PresenceStatus = status
                    .ok_or_else(|| DomainError::invalid_argument("status", "is required"))?
                    .parse()?;
                // 离线只能由断开连接产生
                if status == PresenceStatus::Offline {
                    return Err(DomainError::invalid_argument(
                        "status",
                        "offline cannot be set explicitly",
                    )
                    .into());
                }
                InboundCommand::Status(status)
            }
            ClientFrame::Unknown => return Err(FrameError::UnknownKind),
        };
        Ok(command)
    }
}

/// 发往客户端的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    Message(MessagePayload),
    MessageAck(MessageAckPayload),
    Typing(TypingPayload),
    MessageRead(MessageReadPayload),
    StatusUpdate(StatusUpdatePayload),
    PresenceSnapshot(PresenceSnapshotPayload),
    Pong,
}

impl ServerFrame {
    /// 序列化一次，供多个连接共享
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
    pub is_read: bool,
    pub temp_id: Option<String>,
    pub sender_username: String,
    /// 发送者自己其他设备上的镜像副本
    pub is_owner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAckPayload {
    pub id: MessageId,
    pub temp_id: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub sender_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReadPayload {
    pub reader_id: UserId,
    pub count: u64,
    pub read_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshotPayload {
    pub users: Vec<PresenceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn chat_frame_accepts_both_temp_id_spellings() {
        let recipient = Uuid::new_v4();
        for key in ["tempID", "temp_id"] {
            let text = json!({
                "kind": "chat",
                "recipient": recipient.to_string(),
                "content": " hello ",
                key: "t-1",
            })
            .to_string();

            let command = decode_frame(&text).unwrap();
            assert_eq!(
                command,
                InboundCommand::Chat {
                    recipient: UserId(recipient),
                    content: MessageContent::new("hello").unwrap(),
                    temp_id: Some("t-1".into()),
                }
            );
        }
    }

    #[test]
    fn chat_without_content_is_invalid() {
        let text = json!({"kind": "chat", "recipient": Uuid::new_v4().to_string()}).to_string();
        assert!(matches!(decode_frame(&text), Err(FrameError::Invalid(_))));
    }

    #[test]
    fn unknown_kind_and_garbage_are_classified() {
        assert!(matches!(
            decode_frame(r#"{"kind":"dance"}"#),
            Err(FrameError::UnknownKind)
        ));
        assert!(matches!(
            decode_frame("not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"content":"no kind"}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn typing_stop_and_heartbeat_decode() {
        let recipient = Uuid::new_v4();
        let text = json!({"kind": "typing-stop", "recipient": recipient.to_string()}).to_string();
        assert_eq!(
            decode_frame(&text).unwrap(),
            InboundCommand::Typing {
                recipient: UserId(recipient),
                is_typing: false
            }
        );
        assert_eq!(
            decode_frame(r#"{"kind":"heartbeat","extra":1}"#).unwrap(),
            InboundCommand::Heartbeat
        );
    }

    #[test]
    fn status_frame_rejects_offline() {
        assert_eq!(
            decode_frame(r#"{"kind":"status","status":"away"}"#).unwrap(),
            InboundCommand::Status(PresenceStatus::Away)
        );
        assert!(decode_frame(r#"{"kind":"status","status":"offline"}"#).is_err());
        assert!(decode_frame(r#"{"kind":"status","status":"busy"}"#).is_err());
    }

    #[test]
    fn server_frames_use_type_and_data() {
        let pong = serde_json::to_value(ServerFrame::Pong).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let user_id = UserId(Uuid::new_v4());
        let frame = ServerFrame::Typing(TypingPayload {
            sender_id: user_id,
            is_typing: true,
        });
        let value = serde_json::to_value(frame).unwrap();
        assert_eq!(value["type"], "typing");
        assert_eq!(value["data"]["sender_id"], user_id.to_string());
    }
}
