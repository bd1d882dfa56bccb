//! 内存实现的存储（用于测试和无数据库运行）

use std::collections::HashMap;
use std::sync::Arc;

use domain::{
    Message, MessageId, MessageRepository, NewMessage, PresenceRepository, PresenceState,
    PresenceStatus, RepositoryFuture, Session, SessionRepository, Timestamp, UserId,
};
use futures::FutureExt;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MessageLog {
    last_id: i64,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMessageRepository {
    log: Arc<RwLock<MessageLog>>,
}

impl MemoryMessageRepository {
    pub async fn messages(&self) -> Vec<Message> {
        self.log.read().await.messages.clone()
    }
}

impl MessageRepository for MemoryMessageRepository {
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message> {
        let log = self.log.clone();
        async move {
            let mut log = log.write().await;
            log.last_id += 1;
            let message = Message::persisted(MessageId(log.last_id), message);
            log.messages.push(message.clone());
            Ok(message)
        }
        .boxed()
    }

    fn mark_read(&self, sender: UserId, recipient: UserId) -> RepositoryFuture<u64> {
        let log = self.log.clone();
        async move {
            let mut log = log.write().await;
            let mut count = 0;
            for message in log.messages.iter_mut().filter(|m| {
                m.sender_id == sender && m.recipient_id == recipient && !m.is_read
            }) {
                message.is_read = true;
                count += 1;
            }
            Ok(count)
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPresenceRepository {
    states: Arc<RwLock<HashMap<UserId, PresenceState>>>,
    history: Arc<RwLock<Vec<(UserId, PresenceStatus)>>>,
}

impl MemoryPresenceRepository {
    /// 按写入顺序记录的全部状态变化
    pub async fn history(&self) -> Vec<(UserId, PresenceStatus)> {
        self.history.read().await.clone()
    }
}

impl PresenceRepository for MemoryPresenceRepository {
    fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> RepositoryFuture<()> {
        let states = self.states.clone();
        let history = self.history.clone();
        async move {
            states.write().await.insert(
                user_id,
                PresenceState {
                    user_id,
                    status,
                    last_active: at,
                },
            );
            history.write().await.push((user_id, status));
            Ok(())
        }
        .boxed()
    }

    fn get_status(&self, user_id: UserId) -> RepositoryFuture<Option<PresenceState>> {
        let states = self.states.clone();
        async move { Ok(states.read().await.get(&user_id).cloned()) }.boxed()
    }
}

/// 令牌 -> 会话的静态映射
#[derive(Debug, Clone, Default)]
pub struct MemorySessionRepository {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemorySessionRepository {
    pub async fn insert(&self, token: impl Into<String>, session: Session) {
        self.sessions.write().await.insert(token.into(), session);
    }
}

impl SessionRepository for MemorySessionRepository {
    fn resolve(&self, token: &str) -> RepositoryFuture<Option<Session>> {
        let sessions = self.sessions.clone();
        let token = token.to_owned();
        async move { Ok(sessions.read().await.get(&token).cloned()) }.boxed()
    }
}
