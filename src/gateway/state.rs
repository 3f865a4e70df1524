//! Shared gateway state wired by the service binary.

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::eventlog::EventLog;
use crate::gateway::chat::ChatRelay;
use crate::gateway::location::LocationHub;
use crate::gateway::offers::OfferBroker;
use crate::gateway::rooms::RoomBroker;
use crate::gateway::session::SessionRegistry;
use crate::gateway::subscriptions::SubscriptionRouter;
use crate::store::EphemeralStore;
use std::sync::Arc;

/// Application state shared across all connection tasks.
#[derive(Clone)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub verifier: Arc<TokenVerifier>,
    pub store: Arc<dyn EphemeralStore>,
    pub log: Arc<dyn EventLog>,
    pub broker: Arc<RoomBroker>,
    pub sessions: Arc<SessionRegistry>,
    pub subscriptions: Arc<SubscriptionRouter>,
    pub location: Arc<LocationHub>,
    pub offers: Arc<OfferBroker>,
    pub chat: Arc<ChatRelay>,
}

impl GatewayState {
    /// Build the component graph. `RoomBroker::run_fanout` must be started
    /// by the caller before serving connections.
    pub fn build(
        config: GatewayConfig,
        verifier: Arc<TokenVerifier>,
        store: Arc<dyn EphemeralStore>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let broker = RoomBroker::new(store.clone());
        let subscriptions = Arc::new(SubscriptionRouter::new(store.clone(), broker.clone()));
        let sessions = Arc::new(SessionRegistry::new(
            store.clone(),
            broker.clone(),
            subscriptions.clone(),
            config.clone(),
        ));
        let location = Arc::new(LocationHub::new(
            store.clone(),
            log.clone(),
            subscriptions.clone(),
            &config,
        ));
        let offers = OfferBroker::new(store.clone(), log.clone(), broker.clone(), &config);
        let chat = Arc::new(ChatRelay::new(log.clone(), subscriptions.clone(), &config));
        Self {
            config,
            verifier,
            store,
            log,
            broker,
            sessions,
            subscriptions,
            location,
            offers,
            chat,
        }
    }
}
