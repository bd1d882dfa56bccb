//! 组装实时子系统：调度器、在线状态写入任务和入站处理器

use std::sync::Arc;

use domain::{MessageRepository, PresenceRepository};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherSettings};
use crate::ingest::InboundHandler;
use crate::presence::{PresenceRecorder, PresenceService};
use crate::relay::Relay;

pub struct RealtimeDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub presence: Arc<dyn PresenceRepository>,
    pub settings: DispatcherSettings,
    pub relay: Relay,
    pub clock: Arc<dyn Clock>,
}

impl RealtimeDependencies {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        presence: Arc<dyn PresenceRepository>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            messages,
            presence,
            settings,
            relay: Relay::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct RealtimeHub {
    pub dispatcher: DispatcherHandle,
    pub inbound: InboundHandler,
    pub presence: PresenceService,
    pub relay: Relay,
    pub clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeHub {
    /// 必须在 tokio 运行时内调用
    pub fn start(deps: RealtimeDependencies) -> Self {
        let RealtimeDependencies {
            messages,
            presence,
            settings,
            relay,
            clock,
        } = deps;

        let shutdown = CancellationToken::new();
        let (recorder, recorder_task) = PresenceRecorder::spawn(presence.clone());
        let (dispatcher, dispatcher_task) = Dispatcher::spawn(
            settings,
            relay.clone(),
            recorder,
            clock.clone(),
            shutdown.clone(),
        );

        Self {
            inbound: InboundHandler::new(messages, dispatcher.clone(), relay.clone(), clock.clone()),
            presence: PresenceService::new(dispatcher.clone(), presence),
            dispatcher,
            relay,
            clock,
            shutdown,
            tasks: vec![dispatcher_task, recorder_task],
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 关闭所有连接并等待剩余的在线状态写完
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "实时子系统任务异常退出");
            }
        }
    }
}
