//! Pipeline supervisor: the consume → decode → enrich → persist loop.
//!
//! A single logical worker processes messages strictly sequentially. The
//! only concurrency is the race between message intake and the shutdown
//! signal, merged by `tokio::select!`. Once the signal fires no further
//! message is pulled; the in-flight message always finishes first because
//! processing happens after the race resolves, in the loop body.

use crate::broker::{BrokerError, RawMessage};
use crate::record::{decode, enrich};
use crate::store::RecordSink;
use futures::Stream;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Lifecycle states of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Acquiring connections, declaring the queue
    Starting,
    /// Racing message intake against the shutdown signal
    Running,
    /// Shutdown fired; no new intake, in-flight work finishes
    Draining,
    /// Terminal; all owned resources released
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters accumulated over one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records decoded, enriched and persisted
    pub stored: u64,
    /// Empty payloads skipped without decoding
    pub skipped_empty: u64,
    /// Messages dropped because the payload did not decode
    pub decode_failures: u64,
    /// Records dropped because the sink rejected them
    pub storage_failures: u64,
    /// Errors surfaced by the broker stream itself
    pub broker_errors: u64,
}

/// The control loop driving messages from the broker into the sink
pub struct Pipeline<S> {
    sink: S,
    shutdown_tx: broadcast::Sender<()>,
    // Armed at construction: a receiver subscribed here retains a signal
    // fired before run() enters the loop.
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
}

impl<S: RecordSink> Pipeline<S> {
    pub fn new(sink: S) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            sink,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    /// Get a handle that fires the single-use shutdown signal
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signal the pipeline to stop pulling messages
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the pipeline until the stream ends or shutdown fires.
    ///
    /// Per-message failures are logged and dropped; nothing in the loop
    /// terminates the process. The shutdown arm is polled first so that a
    /// fired signal wins the race against further intake.
    pub async fn run<M>(&self, messages: M) -> PipelineStats
    where
        M: Stream<Item = Result<RawMessage, BrokerError>>,
    {
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());
        let mut stats = PipelineStats::default();
        let mut state = PipelineState::Running;

        tokio::pin!(messages);

        info!(state = %state, "Pipeline entering main loop");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    state = PipelineState::Draining;
                    info!(state = %state, "Shutdown signal received, no further messages will be pulled");
                    break;
                }
                message = messages.next() => {
                    match message {
                        Some(Ok(raw)) => self.handle_message(raw, &mut stats).await,
                        Some(Err(e)) => {
                            error!(error = %e, "Broker stream error");
                            stats.broker_errors += 1;
                        }
                        None => {
                            info!("Message stream ended");
                            break;
                        }
                    }
                }
            }
        }

        state = PipelineState::Stopped;
        info!(
            state = %state,
            stored = stats.stored,
            skipped_empty = stats.skipped_empty,
            decode_failures = stats.decode_failures,
            storage_failures = stats.storage_failures,
            broker_errors = stats.broker_errors,
            "Pipeline stopped"
        );

        stats
    }

    async fn handle_message(&self, raw: RawMessage, stats: &mut PipelineStats) {
        let record = match decode(&raw.payload) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Empty payload, skipping");
                stats.skipped_empty += 1;
                return;
            }
            Err(e) => {
                warn!(error = %e, redelivered = raw.redelivered, "Dropping undecodable message");
                stats.decode_failures += 1;
                return;
            }
        };

        let enriched = enrich(record);
        let user_id = enriched.display_id();

        match self.sink.persist(&enriched).await {
            Ok(()) => {
                info!(user_id = %user_id, "Record stored");
                stats.stored += 1;
            }
            Err(e) => {
                error!(error = %e, user_id = %user_id, "Failed to store record, dropping");
                stats.storage_failures += 1;
            }
        }
    }
}
