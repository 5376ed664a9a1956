// mq-engine: the relay-mq broker core.
//
// The engine owns the registration state machine, the per-topic publication
// path, the frame dispatch pipeline with its handler chains, and the
// liveness monitor.  The TCP acceptor and the HTTP producer edge live in the
// broker service; they talk to the engine through `ConnHandle`, the
// `on_connected` / `on_closed` / `on_received` callbacks, and `publisher`.

mod config;
mod engine;
mod flow;
mod monitor;
mod slots;
mod topic;
mod transport;

pub use config::Config;
pub use engine::{Engine, EngineError, UserHandler};
pub use flow::ChainArgs;
pub use slots::{ConsumerConfig, ConsumerSlot, ProducerConfig, ProducerSlot};
pub use topic::Topic;
pub use transport::{
    CONN_QUEUE_CAPACITY, CloseRequester, ConnHandle, DefaultEventHandler, EventHandler,
    TransportError,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix seconds, saturating to zero before the epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
