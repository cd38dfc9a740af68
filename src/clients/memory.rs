//! In-memory buffered client, used when the durable queue is disabled.
//!
//! Same contract as the durable client minus persistence: a bounded channel
//! decouples the caller from the network, the batcher shapes delivery, and a
//! full channel counts as a queue-full condition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffered::BatchSettings;
use super::retry::{ExponentialBackoff, RetryConfig};
use super::transport::Transport;
use super::{HandleOutcome, LogClient};
use crate::entry::Entry;
use crate::error::ForwardError;
use crate::internal_events::{drop_reason, DroppedLogs, TransportSendFailed};

/// In-flight entries the channel may hold before `handle` reports the queue
/// as full.
const CHANNEL_CAPACITY: usize = 4096;

pub struct MemoryClient {
    sender: mpsc::Sender<Entry>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    endpoint: String,
    drain: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: impl Into<String>,
        batch: BatchSettings,
        retry: RetryConfig,
        runtime: tokio::runtime::Handle,
        parent: &CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = parent.child_token();
        // Cancellation through the parent token (facade close) drains by
        // default; only an explicit `stop` skips the drain.
        let drain = Arc::new(AtomicBool::new(true));
        let endpoint = transport.endpoint().to_owned();

        let worker = runtime.spawn(worker_loop(
            receiver,
            transport,
            cancel.clone(),
            Arc::clone(&drain),
            batch,
            retry,
            host.into(),
        ));

        MemoryClient {
            sender,
            cancel,
            worker: Mutex::new(Some(worker)),
            runtime,
            endpoint,
            drain,
        }
    }

    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else { return };
        if tokio::runtime::Handle::try_current().is_ok() {
            drop(handle);
        } else {
            let _ = self.runtime.block_on(handle);
        }
    }
}

impl LogClient for MemoryClient {
    fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError> {
        if self.cancel.is_cancelled() {
            return Err(ForwardError::ChainStopped);
        }
        match self.sender.try_send(entry) {
            Ok(()) => Ok(HandleOutcome::Accepted),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ForwardError::QueueFull {
                capacity: CHANNEL_CAPACITY,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ForwardError::ChainStopped),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn stop(&self) {
        self.drain.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.join_worker();
    }

    fn stop_wait(&self) {
        self.drain.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.join_worker();
    }
}

async fn worker_loop(
    mut receiver: mpsc::Receiver<Entry>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    drain: Arc<AtomicBool>,
    batch: BatchSettings,
    retry: RetryConfig,
    host: String,
) {
    loop {
        // Wait for the first entry of the next batch.
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Some(entry) => entry,
                None => return,
            },
        };

        let mut entries = vec![first];
        let mut bytes = entries[0].size();
        let deadline = tokio::time::Instant::now() + batch.wait;
        while bytes < batch.size {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                received = receiver.recv() => match received {
                    Some(entry) => {
                        bytes += entry.size();
                        entries.push(entry);
                    }
                    None => break,
                },
            }
        }

        if !send_with_retry(transport.as_ref(), &entries, retry, &cancel, &host).await {
            break;
        }
    }

    if drain.load(Ordering::SeqCst) {
        receiver.close();
        let mut entries = Vec::new();
        while let Ok(entry) = receiver.try_recv() {
            entries.push(entry);
        }
        if !entries.is_empty() {
            if let Err(error) = transport.send(&entries).await {
                DroppedLogs {
                    host: &host,
                    reason: drop_reason::TRANSPORT_FATAL,
                    count: entries.len() as u64,
                }
                .emit();
                debug!(message = "Drain delivery failed.", %error);
            }
        }
    }
}

/// Delivers one batch, retrying transient failures. Returns false when the
/// loop should exit because cancellation fired mid-retry.
async fn send_with_retry(
    transport: &dyn Transport,
    entries: &[Entry],
    retry: RetryConfig,
    cancel: &CancellationToken,
    host: &str,
) -> bool {
    let mut backoff = ExponentialBackoff::new(retry.min_backoff, retry.max_backoff);
    let mut attempt = 0usize;
    loop {
        match transport.send(entries).await {
            Ok(()) => return true,
            Err(error) => {
                let retriable = error.is_retriable();
                TransportSendFailed {
                    endpoint: transport.endpoint(),
                    error: error.to_string(),
                    retriable,
                }
                .emit();
                if !retriable || attempt >= retry.max_retries {
                    // Without a durable queue behind it, an undeliverable
                    // batch is gone.
                    DroppedLogs {
                        host,
                        reason: drop_reason::TRANSPORT_FATAL,
                        count: entries.len() as u64,
                    }
                    .emit();
                    return true;
                }
                attempt += 1;
                let delay = backoff.next().unwrap_or(retry.max_backoff);
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::entry::Labels;
    use crate::error::TransportError;

    struct RecordingTransport {
        batches: Mutex<Vec<usize>>,
        total: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
            self.batches.lock().unwrap().push(entries.len());
            self.total.fetch_add(entries.len(), Ordering::SeqCst);
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "recording"
        }
    }

    fn entry() -> Entry {
        Entry {
            labels: Labels::new(),
            timestamp: Utc::now(),
            line: "line".into(),
        }
    }

    #[test]
    fn all_entries_are_delivered_on_stop_wait() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let transport = Arc::new(RecordingTransport {
            batches: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
        });
        let client = MemoryClient::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "test",
            BatchSettings {
                wait: Duration::from_millis(10),
                size: 64 * 1024,
            },
            RetryConfig {
                min_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
                max_retries: 1,
            },
            runtime.handle().clone(),
            &CancellationToken::new(),
        );

        for _ in 0..10 {
            client.handle(entry()).unwrap();
        }
        client.stop_wait();

        assert_eq!(transport.total.load(Ordering::SeqCst), 10);
    }
}
