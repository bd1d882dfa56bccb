//! 调度器 actor
//!
//! 单任务按到达顺序逐条处理命令，独占注册表。处理命令时从不 await：
//! 投递用 `try_send`，在线状态持久化交给 [`PresenceRecorder`]。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use config::{RealtimeConfig, SessionPolicy};
use domain::{ConnectionId, PresenceStatus, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::connection::{CloseReason, ConnectionHandle, Outbound};
use crate::error::ApplicationError;
use crate::presence::{PresenceChange, PresenceRecorder};
use crate::registry::{OnlineUser, Registry, Removal};
use crate::relay::{Delivery, Relay};

#[derive(Debug)]
pub enum Command {
    Register {
        connection: ConnectionHandle,
    },
    Unregister {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Deliver(Delivery),
    SetStatus {
        user_id: UserId,
        connection_id: ConnectionId,
        status: PresenceStatus,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<OnlineUser>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub buffer: usize,
    pub policy: SessionPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for DispatcherSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            buffer: config.dispatcher_buffer,
            policy: config.session_policy,
        }
    }
}

/// 向调度器提交命令的句柄
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    async fn send(&self, command: Command) -> Result<(), ApplicationError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ApplicationError::DispatcherUnavailable)
    }

    pub async fn register(&self, connection: ConnectionHandle) -> Result<(), ApplicationError> {
        self.send(Command::Register { connection }).await
    }

    pub async fn unregister(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), ApplicationError> {
        self.send(Command::Unregister {
            user_id,
            connection_id,
        })
        .await
    }

    pub async fn deliver(&self, delivery: Delivery) -> Result<(), ApplicationError> {
        if delivery.is_empty() {
            return Ok(());
        }
        self.send(Command::Deliver(delivery)).await
    }

    pub async fn set_status(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        status: PresenceStatus,
    ) -> Result<(), ApplicationError> {
        self.send(Command::SetStatus {
            user_id,
            connection_id,
            status,
        })
        .await
    }

    /// 当前在线用户；同时也是一个屏障，返回时之前提交的命令都已处理完
    pub async fn snapshot(&self) -> Result<Vec<OnlineUser>, ApplicationError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| ApplicationError::DispatcherUnavailable)
    }
}

pub struct Dispatcher {
    registry: Registry,
    relay: Relay,
    recorder: PresenceRecorder,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    rx: mpsc::Receiver<Command>,
}

impl Dispatcher {
    pub fn spawn(
        settings: DispatcherSettings,
        relay: Relay,
        recorder: PresenceRecorder,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.buffer.max(1));
        let dispatcher = Self {
            registry: Registry::new(),
            relay,
            recorder,
            clock,
            policy: settings.policy,
            rx,
        };
        let task = tokio::spawn(dispatcher.run(shutdown));
        (DispatcherHandle { tx }, task)
    }

    async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(policy = ?self.policy, "调度器已启动");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        self.close_all();
        tracing::info!("调度器已停止");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { connection } => self.register(connection),
            Command::Unregister {
                user_id,
                connection_id,
            } => self.unregister(user_id, connection_id),
            Command::Deliver(delivery) => self.fan_out(delivery),
            Command::SetStatus {
                user_id,
                connection_id,
                status,
            } => self.set_status(user_id, connection_id, status),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    fn register(&mut self, connection: ConnectionHandle) {
        let user_id = connection.user_id();
        let announce = match self.policy {
            SessionPolicy::MultiDevice => self
                .registry
                .insert(connection.clone())
                .then_some(PresenceStatus::Online),
            SessionPolicy::SingleSession => {
                let (replaced, previous) = self.registry.supersede(connection.clone());
                for old in &replaced {
                    tracing::info!(
                        user_id = %user_id,
                        connection_id = %old.id(),
                        "连接被同一用户的新连接取代"
                    );
                    old.close(CloseReason::Superseded);
                }
                match previous {
                    Some(PresenceStatus::Online) => None,
                    _ => Some(PresenceStatus::Online),
                }
            }
        };

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection.id(),
            connections = self.registry.connections(user_id).len(),
            "连接已注册"
        );

        match self.relay.presence_snapshot(user_id, &self.registry) {
            Ok(snapshot) => {
                if let Err(err) = connection.try_push(Outbound::Text(snapshot)) {
                    tracing::warn!(connection_id = %connection.id(), error = %err, "在线列表推送失败");
                    let next = self.detach(&connection, CloseReason::SlowConsumer);
                    self.fan_out_all(next);
                }
            }
            Err(err) => tracing::error!(error = %err, "在线列表序列化失败"),
        }

        if let Some(status) = announce {
            // 快照推送失败时连接可能已被移除
            if self.registry.status(user_id).is_some() {
                let next = self.presence_change(user_id, status);
                self.fan_out_all(next);
            }
        }
    }

    fn unregister(&mut self, user_id: UserId, connection_id: ConnectionId) {
        match self.registry.remove(user_id, connection_id) {
            Removal::Last => {
                tracing::debug!(user_id = %user_id, connection_id = %connection_id, "用户最后一条连接已断开");
                let next = self.presence_change(user_id, PresenceStatus::Offline);
                self.fan_out_all(next);
            }
            Removal::Remaining => {
                tracing::debug!(user_id = %user_id, connection_id = %connection_id, "连接已注销");
            }
            Removal::Absent => {}
        }
    }

    fn set_status(&mut self, user_id: UserId, connection_id: ConnectionId, status: PresenceStatus) {
        if !self.registry.contains(user_id, connection_id) {
            return;
        }
        if self.registry.set_status(user_id, status) {
            let next = self.presence_change(user_id, status);
            self.fan_out_all(next);
        }
    }

    /// 持久化并生成广播，广播目标按当前注册表计算
    fn presence_change(&mut self, user_id: UserId, status: PresenceStatus) -> Option<Delivery> {
        let at = self.clock.now();
        self.recorder.record(PresenceChange {
            user_id,
            status,
            at,
        });
        match self.relay.presence(user_id, status, at, &self.registry) {
            Ok(delivery) => Some(delivery),
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "在线状态广播序列化失败");
                None
            }
        }
    }

    fn fan_out_all(&mut self, delivery: Option<Delivery>) {
        if let Some(delivery) = delivery {
            self.fan_out(delivery);
        }
    }

    /// 推送失败的连接被关闭并移除，但不影响其他目标；移除引起的离线广播排队继续处理
    fn fan_out(&mut self, delivery: Delivery) {
        let mut pending = VecDeque::from([delivery]);
        while let Some(delivery) = pending.pop_front() {
            let mut dead = Vec::new();
            for target in &delivery.targets {
                for connection in self.registry.connections(target.user_id) {
                    if target.skip == Some(connection.id()) {
                        continue;
                    }
                    if let Err(err) = connection.try_push(Outbound::Text(target.payload.clone())) {
                        tracing::warn!(
                            user_id = %target.user_id,
                            connection_id = %connection.id(),
                            error = %err,
                            "推送失败，移除连接"
                        );
                        dead.push(connection.clone());
                    }
                }
            }
            for connection in dead {
                if let Some(next) = self.detach(&connection, CloseReason::SlowConsumer) {
                    pending.push_back(next);
                }
            }
        }
    }

    fn detach(&mut self, connection: &ConnectionHandle, reason: CloseReason) -> Option<Delivery> {
        connection.close(reason);
        match self.registry.remove(connection.user_id(), connection.id()) {
            Removal::Last => self.presence_change(connection.user_id(), PresenceStatus::Offline),
            Removal::Remaining | Removal::Absent => None,
        }
    }

    fn close_all(&mut self) {
        let connections = self.registry.drain();
        let mut users = HashSet::new();
        for connection in &connections {
            connection.close(CloseReason::Shutdown);
            users.insert(connection.user_id());
        }
        let at = self.clock.now();
        for user_id in users {
            self.recorder.record(PresenceChange {
                user_id,
                status: PresenceStatus::Offline,
                at,
            });
        }
    }
}
