use std::sync::Arc;

use crate::services::{
    auth::TokenVerifier,
    dispatcher::Dispatcher,
    fanout::{EventSink, Fanout},
    queue::Broker,
    status::StatusService,
    store::JobStore,
    topology::Topology,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub topology: Arc<Topology>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub fanout: Arc<Fanout>,
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusService,
    pub auth: Arc<TokenVerifier>,
}

impl AppState {
    /// `sink` receives the dispatcher's events: the local `fanout` itself
    /// when everything runs in one process, a Redis publisher otherwise.
    pub fn new(
        topology: Arc<Topology>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        fanout: Arc<Fanout>,
        sink: Arc<dyn EventSink>,
        auth: TokenVerifier,
    ) -> Self {
        let dispatcher = Dispatcher::new(topology.clone(), store.clone(), broker.clone(), sink);
        Self {
            status: StatusService::new(store.clone()),
            dispatcher: Arc::new(dispatcher),
            topology,
            store,
            broker,
            fanout,
            auth: Arc::new(auth),
        }
    }
}
