//! 入站帧处理：解码 -> 分类 -> (持久化) -> 提交给调度器
//!
//! 持久化发生在发送者自己的读循环里，慢存储只会拖慢该发送者。

use std::sync::Arc;

use domain::{DomainError, MessageRepository, NewMessage, UserId};

use crate::clock::Clock;
use crate::connection::{CloseReason, ConnectionHandle, Outbound, PushError};
use crate::dispatcher::DispatcherHandle;
use crate::error::ApplicationError;
use crate::protocol::{decode_frame, InboundCommand};
use crate::relay::Relay;

/// 一帧处理后的结果，供传输层记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 已提交给调度器
    Dispatched,
    /// 直接回复了当前连接
    Replied,
    /// 无需任何动作
    Ignored,
}

#[derive(Clone)]
pub struct InboundHandler {
    messages: Arc<dyn MessageRepository>,
    dispatcher: DispatcherHandle,
    relay: Relay,
    clock: Arc<dyn Clock>,
}

impl InboundHandler {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        dispatcher: DispatcherHandle,
        relay: Relay,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            messages,
            dispatcher,
            relay,
            clock,
        }
    }

    /// 处理一帧文本。返回错误时连接保持打开，由调用方记录日志
    pub async fn handle_text(
        &self,
        connection: &ConnectionHandle,
        text: &str,
    ) -> Result<IngestOutcome, ApplicationError> {
        let command = decode_frame(text)?;
        let me = connection.user_id();

        match command {
            InboundCommand::Chat {
                recipient,
                content,
                temp_id,
            } => {
                ensure_not_self(me, recipient)?;
                let message = self
                    .messages
                    .append(NewMessage {
                        sender_id: me,
                        recipient_id: recipient,
                        content,
                        created_at: self.clock.now(),
                    })
                    .await?;

                tracing::debug!(
                    message_id = %message.id,
                    sender_id = %me,
                    recipient_id = %recipient,
                    "私信已保存"
                );

                let ack = self.relay.message_ack(&message, temp_id.as_deref())?;
                reply(connection, ack);

                let delivery = self.relay.chat(&message, connection, temp_id.as_deref())?;
                self.dispatcher.deliver(delivery).await?;
                Ok(IngestOutcome::Dispatched)
            }
            InboundCommand::Typing {
                recipient,
                is_typing,
            } => {
                ensure_not_self(me, recipient)?;
                let delivery = self.relay.typing(me, recipient, is_typing)?;
                self.dispatcher.deliver(delivery).await?;
                Ok(IngestOutcome::Dispatched)
            }
            InboundCommand::ReadAck { sender } => {
                ensure_not_self(me, sender)?;
                let count = self.messages.mark_read(sender, me).await?;
                // 没有未读时也通知，count 为 0
                let delivery = self
                    .relay
                    .read_receipt(me, sender, count, self.clock.now())?;
                self.dispatcher.deliver(delivery).await?;
                Ok(IngestOutcome::Dispatched)
            }
            InboundCommand::Heartbeat => {
                reply(connection, self.relay.pong()?);
                Ok(IngestOutcome::Replied)
            }
            InboundCommand::Pong => Ok(IngestOutcome::Ignored),
            InboundCommand::Status(status) => {
                self.dispatcher
                    .set_status(me, connection.id(), status)
                    .await?;
                Ok(IngestOutcome::Dispatched)
            }
        }
    }
}

fn ensure_not_self(me: UserId, other: UserId) -> Result<(), DomainError> {
    if me == other {
        return Err(DomainError::invalid_argument(
            "recipient",
            "cannot address yourself",
        ));
    }
    Ok(())
}

fn reply(connection: &ConnectionHandle, payload: Arc<str>) {
    match connection.try_push(Outbound::Text(payload)) {
        Ok(()) | Err(PushError::Closed) => {}
        Err(PushError::Full) => {
            tracing::warn!(connection_id = %connection.id(), "出站队列已满，关闭连接");
            connection.close(CloseReason::SlowConsumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::OutboundQueue;
    use crate::dispatcher::{Dispatcher, DispatcherSettings};
    use crate::memory::{MemoryMessageRepository, MemoryPresenceRepository};
    use crate::presence::PresenceRecorder;
    use crate::protocol::{FrameError, ServerFrame};
    use domain::{
        Message, MessageId, MockMessageRepository, RepositoryError, Session,
    };
    use futures::FutureExt;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Harness {
        handler: InboundHandler,
        dispatcher: DispatcherHandle,
    }

    fn start(messages: Arc<dyn MessageRepository>) -> Harness {
        let (recorder, _) = PresenceRecorder::spawn(Arc::new(MemoryPresenceRepository::default()));
        let (dispatcher, _) = Dispatcher::spawn(
            DispatcherSettings::default(),
            Relay::default(),
            recorder,
            Arc::new(SystemClock),
            CancellationToken::new(),
        );
        let handler = InboundHandler::new(
            messages,
            dispatcher.clone(),
            Relay::default(),
            Arc::new(SystemClock),
        );
        Harness {
            handler,
            dispatcher,
        }
    }

    async fn connect(
        harness: &Harness,
        user_id: UserId,
        username: &str,
    ) -> (ConnectionHandle, OutboundQueue) {
        let session = Session::new(user_id, username);
        let (handle, queue) = ConnectionHandle::new(&session, chrono::Utc::now(), 32);
        harness.dispatcher.register(handle.clone()).await.unwrap();
        (handle, queue)
    }

    /// 等调度器处理完之前的命令后取出队列里的帧，忽略在线状态相关的帧
    async fn frames(harness: &Harness, queue: &mut OutboundQueue) -> Vec<ServerFrame> {
        harness.dispatcher.snapshot().await.unwrap();
        let mut frames = Vec::new();
        while let Ok(Outbound::Text(text)) = queue.try_recv() {
            let frame: ServerFrame = serde_json::from_str(&text).unwrap();
            if !matches!(
                frame,
                ServerFrame::StatusUpdate(_) | ServerFrame::PresenceSnapshot(_)
            ) {
                frames.push(frame);
            }
        }
        frames
    }

    fn chat(recipient: UserId, content: &str, temp_id: &str) -> String {
        json!({
            "kind": "chat",
            "recipient": recipient.to_string(),
            "content": content,
            "tempID": temp_id,
        })
        .to_string()
    }

    #[tokio::test]
    async fn chat_reaches_recipient_and_mirrors_to_sender_devices() {
        let store = MemoryMessageRepository::default();
        let harness = start(Arc::new(store.clone()));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (phone, mut phone_q) = connect(&harness, alice, "alice").await;
        let (_laptop, mut laptop_q) = connect(&harness, alice, "alice").await;
        let (_bob, mut bob_q) = connect(&harness, bob, "bob").await;

        let outcome = harness
            .handler
            .handle_text(&phone, &chat(bob, "hello", "t-1"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Dispatched);

        let stored = store.messages().await;
        assert_eq!(stored.len(), 1);
        let id = stored[0].id;

        let bob_frames = frames(&harness, &mut bob_q).await;
        assert_eq!(bob_frames.len(), 1);
        let ServerFrame::Message(received) = &bob_frames[0] else {
            panic!("expected message, got {bob_frames:?}");
        };
        assert_eq!(received.id, id);
        assert!(!received.is_owner);
        assert_eq!(received.sender_username, "alice");

        let laptop_frames = frames(&harness, &mut laptop_q).await;
        assert_eq!(laptop_frames.len(), 1);
        assert!(matches!(&laptop_frames[0], ServerFrame::Message(m) if m.is_owner && m.id == id));

        // 来源连接只收到确认，没有镜像
        let phone_frames = frames(&harness, &mut phone_q).await;
        assert_eq!(phone_frames.len(), 1);
        let ServerFrame::MessageAck(ack) = &phone_frames[0] else {
            panic!("expected ack, got {phone_frames:?}");
        };
        assert_eq!(ack.id, id);
        assert_eq!(ack.temp_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn persistence_failure_delivers_nothing() {
        let mut store = MockMessageRepository::new();
        store
            .expect_append()
            .times(1)
            .returning(|_| futures::future::ready(Err(RepositoryError::storage("down"))).boxed());
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (sender, mut sender_q) = connect(&harness, alice, "alice").await;
        let (_bob, mut bob_q) = connect(&harness, bob, "bob").await;

        let result = harness
            .handler
            .handle_text(&sender, &chat(bob, "hello", "t-1"))
            .await;
        assert!(matches!(result, Err(ApplicationError::Repository(_))));

        assert!(frames(&harness, &mut bob_q).await.is_empty());
        assert!(frames(&harness, &mut sender_q).await.is_empty());
        assert!(!sender.is_closed());
    }

    #[tokio::test]
    async fn chats_from_one_connection_arrive_in_order() {
        let store = MemoryMessageRepository::default();
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (sender, _sender_q) = connect(&harness, alice, "alice").await;
        let (_bob, mut bob_q) = connect(&harness, bob, "bob").await;

        for (i, text) in ["first", "second", "third"].iter().enumerate() {
            harness
                .handler
                .handle_text(&sender, &chat(bob, text, &format!("t-{i}")))
                .await
                .unwrap();
        }

        let contents: Vec<String> = frames(&harness, &mut bob_q)
            .await
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Message(m) => Some(m.content),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn typing_is_never_persisted_or_echoed() {
        let mut store = MockMessageRepository::new();
        store.expect_append().never();
        store.expect_mark_read().never();
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (phone, mut phone_q) = connect(&harness, alice, "alice").await;
        let (_laptop, mut laptop_q) = connect(&harness, alice, "alice").await;
        let (_bob, mut bob_q) = connect(&harness, bob, "bob").await;

        for kind in ["typing", "typing-stop"] {
            let text = json!({"kind": kind, "recipient": bob.to_string()}).to_string();
            harness.handler.handle_text(&phone, &text).await.unwrap();
        }

        let bob_frames = frames(&harness, &mut bob_q).await;
        assert_eq!(bob_frames.len(), 2);
        assert!(
            matches!(&bob_frames[0], ServerFrame::Typing(t) if t.sender_id == alice && t.is_typing)
        );
        assert!(matches!(&bob_frames[1], ServerFrame::Typing(t) if !t.is_typing));
        assert!(frames(&harness, &mut phone_q).await.is_empty());
        assert!(frames(&harness, &mut laptop_q).await.is_empty());
    }

    #[tokio::test]
    async fn read_ack_marks_pair_and_notifies_sender_devices() {
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let mut store = MockMessageRepository::new();
        store
            .expect_mark_read()
            .withf(move |sender, recipient| *sender == alice && *recipient == bob)
            .times(1)
            .returning(|_, _| futures::future::ready(Ok(3)).boxed());
        let harness = start(Arc::new(store));

        let (_a1, mut a1_q) = connect(&harness, alice, "alice").await;
        let (_a2, mut a2_q) = connect(&harness, alice, "alice").await;
        let (reader, mut reader_q) = connect(&harness, bob, "bob").await;

        let text = json!({"kind": "read-ack", "recipient": alice.to_string()}).to_string();
        harness.handler.handle_text(&reader, &text).await.unwrap();

        for queue in [&mut a1_q, &mut a2_q] {
            let received = frames(&harness, queue).await;
            assert_eq!(received.len(), 1);
            assert!(
                matches!(&received[0], ServerFrame::MessageRead(r) if r.reader_id == bob && r.count == 3)
            );
        }
        assert!(frames(&harness, &mut reader_q).await.is_empty());
    }

    #[tokio::test]
    async fn read_ack_with_nothing_unread_still_notifies() {
        let mut store = MockMessageRepository::new();
        store
            .expect_mark_read()
            .times(1)
            .returning(|_, _| futures::future::ready(Ok(0)).boxed());
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (_a1, mut a1_q) = connect(&harness, alice, "alice").await;
        let (_a2, mut a2_q) = connect(&harness, alice, "alice").await;
        let (reader, _r_q) = connect(&harness, bob, "bob").await;

        let text = json!({"kind": "read-ack", "recipient": alice.to_string()}).to_string();
        let outcome = harness.handler.handle_text(&reader, &text).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dispatched);

        for queue in [&mut a1_q, &mut a2_q] {
            let received = frames(&harness, queue).await;
            assert_eq!(received.len(), 1);
            assert!(
                matches!(&received[0], ServerFrame::MessageRead(r) if r.reader_id == bob && r.count == 0)
            );
        }
    }

    #[tokio::test]
    async fn heartbeat_is_answered_directly() {
        let harness = start(Arc::new(MemoryMessageRepository::default()));
        let (conn, mut queue) = connect(&harness, UserId(Uuid::new_v4()), "alice").await;

        let outcome = harness
            .handler
            .handle_text(&conn, r#"{"kind":"heartbeat"}"#)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Replied);
        assert_eq!(frames(&harness, &mut queue).await, vec![ServerFrame::Pong]);

        let outcome = harness
            .handler
            .handle_text(&conn, r#"{"kind":"pong"}"#)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
    }

    #[tokio::test]
    async fn invalid_frames_are_rejected_without_side_effects() {
        let mut store = MockMessageRepository::new();
        store.expect_append().never();
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let (conn, _q) = connect(&harness, alice, "alice").await;

        let to_self = chat(alice, "hello me", "t-1");
        assert!(matches!(
            harness.handler.handle_text(&conn, &to_self).await,
            Err(ApplicationError::Domain(_))
        ));
        assert!(matches!(
            harness.handler.handle_text(&conn, "{oops").await,
            Err(ApplicationError::Frame(FrameError::Malformed(_)))
        ));
        assert!(matches!(
            harness.handler.handle_text(&conn, r#"{"kind":"poke"}"#).await,
            Err(ApplicationError::Frame(FrameError::UnknownKind))
        ));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn mock_append_returns_store_assigned_id() {
        let mut store = MockMessageRepository::new();
        store.expect_append().returning(|message| {
            futures::future::ready(Ok(Message::persisted(MessageId(42), message))).boxed()
        });
        let harness = start(Arc::new(store));
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let (conn, mut queue) = connect(&harness, alice, "alice").await;

        harness
            .handler
            .handle_text(&conn, &chat(bob, "offline bob", "t-9"))
            .await
            .unwrap();

        // 接收者不在线时静默丢弃，发送者仍然拿到确认
        let received = frames(&harness, &mut queue).await;
        assert!(matches!(&received[..], [ServerFrame::MessageAck(ack)] if ack.id == MessageId(42)));
    }
}
