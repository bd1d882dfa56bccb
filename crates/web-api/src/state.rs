use std::sync::Arc;

use application::{Clock, DispatcherHandle, InboundHandler, PresenceService, RealtimeHub};
use config::RealtimeConfig;
use domain::SessionRepository;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
    pub inbound: InboundHandler,
    pub presence: PresenceService,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<dyn SessionRepository>,
    pub realtime: RealtimeConfig,
}

impl AppState {
    pub fn new(
        hub: &RealtimeHub,
        sessions: Arc<dyn SessionRepository>,
        realtime: RealtimeConfig,
    ) -> Self {
        Self {
            dispatcher: hub.dispatcher.clone(),
            inbound: hub.inbound.clone(),
            presence: hub.presence.clone(),
            clock: hub.clock.clone(),
            sessions,
            realtime,
        }
    }
}
