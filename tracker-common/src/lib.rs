pub mod events;
pub mod ingest;
pub mod liveness;
pub mod metrics;
pub mod model;
pub mod rawlog;
pub mod store;
pub mod webhook;
