pub mod auth;
pub mod consumer;
pub mod dispatcher;
pub mod event_bus;
pub mod executor;
pub mod fanout;
pub mod memory_queue;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod status;
pub mod store;
pub mod topology;
pub mod transport;
pub mod worker_pool;
