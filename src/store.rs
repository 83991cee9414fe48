//! Document store sink.
//!
//! Write-only, append-only: each accepted message becomes one inserted
//! document. No updates, no reads, no deduplication — a redelivered message
//! is stored twice by design.

use crate::config::StoreConfig;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use mongodb::bson::{self, doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use thiserror::Error;
use tracing::info;

/// Errors that can occur while persisting records
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to connect to store: {0}")]
    Connection(String),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] bson::ser::Error),

    #[error("Failed to insert document: {0}")]
    Insert(String),
}

/// Destination for enriched records.
///
/// The seam that lets the supervisor run against an in-memory double in
/// tests; the production implementation is [`MongoSink`].
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one enriched record. Errors are per-record and non-fatal to
    /// the pipeline.
    async fn persist(&self, record: &EnrichedRecord) -> Result<(), StorageError>;
}

/// MongoDB-backed sink inserting into a single collection
pub struct MongoSink {
    collection: Collection<Document>,
}

impl MongoSink {
    /// Connect to the store and verify reachability.
    ///
    /// The driver connects lazily, so an explicit ping bounded by the
    /// configured timeout is issued here; an unreachable store fails
    /// startup instead of surfacing on the first insert.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        info!(uri = %config.uri, "Connecting to document store");

        let timeout = config.connect_timeout();
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client =
            Client::with_options(options).map_err(|e| StorageError::Connection(e.to_string()))?;

        let database = client.database(&config.database);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(
            database = %config.database,
            collection = %config.collection,
            "Document store connection established"
        );

        Ok(Self {
            collection: database.collection(&config.collection),
        })
    }
}

#[async_trait]
impl RecordSink for MongoSink {
    async fn persist(&self, record: &EnrichedRecord) -> Result<(), StorageError> {
        let document = record.to_document()?;
        self.collection
            .insert_one(document, None)
            .await
            .map_err(|e| StorageError::Insert(e.to_string()))?;
        Ok(())
    }
}
