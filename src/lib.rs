//! gdash-worker - queue-to-store bridge for the gdash climate platform
//!
//! This library consumes event records from an AMQP queue, stamps each one
//! with a receipt timestamp and writes it as a document to MongoDB. It
//! handles:
//!
//! - Broker connection lifecycle with a configurable startup retry policy
//! - Structural decoding of JSON payloads (bad messages are dropped, never fatal)
//! - Graceful, signal-driven shutdown that lets in-flight work finish
//!
//! # Example
//!
//! ```rust,no_run
//! use gdash_worker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::load()?;
//!
//!     let broker = BrokerConnector::connect(&config.broker).await?;
//!     broker.declare_queue(&config.broker.queue).await?;
//!     let subscription = broker
//!         .subscribe(&config.broker.queue, &config.broker.consumer_tag)
//!         .await?;
//!
//!     let sink = MongoSink::connect(&config.store).await?;
//!     let pipeline = Pipeline::new(sink);
//!     pipeline.run(subscription.into_stream()).await;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod record;
pub mod store;
pub mod supervisor;

// Re-export main types
pub use broker::{BrokerConnector, BrokerError, RawMessage, Subscription};
pub use config::{
    BrokerConfig, ServiceConfig, StartupConfig, StartupFailurePolicy, StoreConfig, WorkerConfig,
};
pub use record::{decode, enrich, DecodeError, EnrichedRecord, Record};
pub use store::{MongoSink, RecordSink, StorageError};
pub use supervisor::{Pipeline, PipelineState, PipelineStats};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{BrokerConnector, BrokerError, RawMessage};
    pub use crate::config::WorkerConfig;
    pub use crate::record::{decode, enrich, DecodeError, EnrichedRecord, Record};
    pub use crate::store::{MongoSink, RecordSink, StorageError};
    pub use crate::supervisor::{Pipeline, PipelineState, PipelineStats};
}
