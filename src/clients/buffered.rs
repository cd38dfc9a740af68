//! Durable buffered client.
//!
//! Wraps one transport with the persistent segmented queue. `handle` appends
//! to disk on the caller's thread and returns; a background dequeuer batches
//! entries by size and age, delivers them, and acknowledges the queue only
//! after the transport accepted the batch. Delivery is therefore
//! at-least-once across crashes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logshuttle_queue::{
    open, PushError, QueueConfig, QueueReader, QueueWriter,
};
use snafu::ResultExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry::{ExponentialBackoff, RetryConfig};
use super::transport::Transport;
use super::{HandleOutcome, LogClient};
use crate::entry::Entry;
use crate::error::{BuildError, ForwardError, QueueOpenSnafu};
use crate::internal_events::{drop_reason, DroppedLogs, TransportSendFailed};

/// Batch shaping for the background dequeuer.
#[derive(Clone, Copy, Debug)]
pub struct BatchSettings {
    /// Longest a batch waits for more entries once it has one.
    pub wait: Duration,
    /// Payload budget per batch, in bytes.
    pub size: usize,
}

/// Frames pulled from the queue per read call.
const READ_CHUNK_RECORDS: usize = 128;

/// Bound on the post-cancellation drain performed by `stop_wait`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BufferedClient {
    writer: QueueWriter,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    drain: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    endpoint: String,
    host: String,
}

impl BufferedClient {
    /// Opens the queue and spawns the dequeuer on `runtime`.
    pub fn new(
        transport: Arc<dyn Transport>,
        host: impl Into<String>,
        queue_config: QueueConfig,
        batch: BatchSettings,
        retry: RetryConfig,
        runtime: tokio::runtime::Handle,
        parent: &CancellationToken,
    ) -> Result<Self, BuildError> {
        let host = host.into();
        let (writer, reader) = open(queue_config).context(QueueOpenSnafu)?;

        let notify = Arc::new(Notify::new());
        let cancel = parent.child_token();
        // Cancellation through the parent token (facade close) drains by
        // default; only an explicit `stop` skips the drain.
        let drain = Arc::new(AtomicBool::new(true));
        let endpoint = transport.endpoint().to_owned();

        let worker = runtime.spawn(worker_loop(
            reader,
            transport,
            Arc::clone(&notify),
            cancel.clone(),
            Arc::clone(&drain),
            batch,
            retry,
            host.clone(),
        ));

        Ok(BufferedClient {
            writer,
            notify,
            cancel,
            drain,
            worker: Mutex::new(Some(worker)),
            runtime,
            endpoint,
            host,
        })
    }

    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else { return };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Joining from a runtime worker would deadlock it; the dequeuer
            // still drains on its own since cancellation is already set.
            drop(handle);
        } else {
            let _ = self.runtime.block_on(handle);
        }
    }
}

impl LogClient for BufferedClient {
    fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError> {
        if self.cancel.is_cancelled() {
            return Err(ForwardError::ChainStopped);
        }
        let payload = serde_json::to_vec(&entry).map_err(|e| ForwardError::Enqueue {
            reason: e.to_string(),
        })?;
        match self.writer.push(&payload) {
            Ok(outcome) => {
                if outcome.dropped > 0 {
                    DroppedLogs {
                        host: &self.host,
                        reason: drop_reason::QUEUE_OVERFLOW,
                        count: outcome.dropped as u64,
                    }
                    .emit();
                }
                self.notify.notify_one();
                Ok(HandleOutcome::Accepted)
            }
            Err(PushError::Full { capacity }) => Err(ForwardError::QueueFull { capacity }),
            Err(PushError::RecordTooLarge { .. }) => {
                DroppedLogs {
                    host: &self.host,
                    reason: drop_reason::OVERSIZED,
                    count: 1,
                }
                .emit();
                Ok(HandleOutcome::Discarded)
            }
            Err(PushError::PushIo { source }) => Err(ForwardError::Enqueue {
                reason: source.to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn stop(&self) {
        self.drain.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.notify.notify_one();
        self.join_worker();
    }

    fn stop_wait(&self) {
        self.drain.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.notify.notify_one();
        self.join_worker();
    }
}

enum Delivery {
    Delivered,
    Fatal,
    Exhausted,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    mut reader: QueueReader,
    transport: Arc<dyn Transport>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    drain: Arc<AtomicBool>,
    batch: BatchSettings,
    retry: RetryConfig,
    host: String,
) {
    let mut carry: Vec<(u64, Entry)> = Vec::new();
    loop {
        if carry.is_empty() {
            match fill_batch(&mut reader, &notify, &cancel, batch, &host).await {
                Some(filled) if !filled.is_empty() => carry = filled,
                Some(_) => continue,
                None => break,
            }
        }

        match deliver(transport.as_ref(), &carry, retry, &cancel).await {
            Delivery::Delivered => {
                finish_batch(&mut reader, &carry);
                carry.clear();
            }
            Delivery::Fatal => {
                DroppedLogs {
                    host: &host,
                    reason: drop_reason::TRANSPORT_FATAL,
                    count: carry.len() as u64,
                }
                .emit();
                finish_batch(&mut reader, &carry);
                carry.clear();
            }
            Delivery::Exhausted => {
                // The batch stays in memory and on disk; pause a full cycle
                // before trying again.
                debug!(
                    message = "Delivery attempts exhausted; batch parked.",
                    endpoint = %transport.endpoint(),
                    records = carry.len(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry.max_backoff) => {}
                }
            }
            Delivery::Cancelled => break,
        }
    }

    if drain.load(Ordering::SeqCst) {
        let drained = tokio::time::timeout(
            DRAIN_TIMEOUT,
            drain_remaining(&mut reader, transport.as_ref(), carry, &host),
        )
        .await;
        if drained.is_err() {
            warn!(
                message = "Drain window elapsed with records left on disk.",
                endpoint = %transport.endpoint(),
            );
        }
    }
}

fn finish_batch(reader: &mut QueueReader, carry: &[(u64, Entry)]) {
    if let Some((last_seq, _)) = carry.last() {
        if let Err(error) = reader.ack(*last_seq) {
            warn!(message = "Failed to acknowledge delivered batch.", %error);
        }
    }
}

/// Reads one decoded chunk; returns the decoded records and the raw last
/// sequence number seen (which may trail undecodable frames).
fn read_chunk(reader: &mut QueueReader, host: &str) -> (Vec<(u64, Entry)>, Option<u64>) {
    let records = match reader.read(READ_CHUNK_RECORDS) {
        Ok(records) => records,
        Err(error) => {
            warn!(message = "Failed to read from queue.", %error);
            return (Vec::new(), None);
        }
    };
    let mut last_seq = None;
    let mut decoded = Vec::with_capacity(records.len());
    let mut undecodable = 0u64;
    for record in records {
        last_seq = Some(record.seq);
        match serde_json::from_slice::<Entry>(&record.payload) {
            Ok(entry) => decoded.push((record.seq, entry)),
            Err(_) => undecodable += 1,
        }
    }
    if undecodable > 0 {
        DroppedLogs {
            host,
            reason: drop_reason::ENQUEUE_FAILED,
            count: undecodable,
        }
        .emit();
    }
    (decoded, last_seq)
}

async fn fill_batch(
    reader: &mut QueueReader,
    notify: &Notify,
    cancel: &CancellationToken,
    batch: BatchSettings,
    host: &str,
) -> Option<Vec<(u64, Entry)>> {
    // Wait for the first record.
    let mut records = loop {
        if cancel.is_cancelled() {
            return None;
        }
        let (chunk, last_seq) = read_chunk(reader, host);
        if !chunk.is_empty() {
            break chunk;
        }
        if let Some(seq) = last_seq {
            // Everything read was undecodable; acknowledge so it does not
            // pin its segment forever.
            if let Err(error) = reader.ack(seq) {
                warn!(message = "Failed to acknowledge undecodable frames.", %error);
            }
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = notify.notified() => {}
        }
    };

    // Top the batch up until the byte budget or the batch window closes.
    let deadline = tokio::time::Instant::now() + batch.wait;
    let mut bytes: usize = records.iter().map(|(_, e)| e.size()).sum();
    while bytes < batch.size {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            _ = notify.notified() => {
                let (chunk, _) = read_chunk(reader, host);
                bytes += chunk.iter().map(|(_, e)| e.size()).sum::<usize>();
                records.extend(chunk);
            }
        }
    }
    Some(records)
}

async fn deliver(
    transport: &dyn Transport,
    carry: &[(u64, Entry)],
    retry: RetryConfig,
    cancel: &CancellationToken,
) -> Delivery {
    let entries: Vec<Entry> = carry.iter().map(|(_, entry)| entry.clone()).collect();
    let mut backoff = ExponentialBackoff::new(retry.min_backoff, retry.max_backoff);
    let mut attempt = 0usize;
    loop {
        match transport.send(&entries).await {
            Ok(()) => return Delivery::Delivered,
            Err(error) => {
                let retriable = error.is_retriable();
                TransportSendFailed {
                    endpoint: transport.endpoint(),
                    error: error.to_string(),
                    retriable,
                }
                .emit();
                if !retriable {
                    return Delivery::Fatal;
                }
                attempt += 1;
                if attempt > retry.max_retries {
                    return Delivery::Exhausted;
                }
                let delay = backoff.next().unwrap_or(retry.max_backoff);
                tokio::select! {
                    _ = cancel.cancelled() => return Delivery::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Final drain after cancellation: one delivery attempt per batch, no
/// retries. Anything the transport refuses stays on disk for the next run.
async fn drain_remaining(
    reader: &mut QueueReader,
    transport: &dyn Transport,
    mut carry: Vec<(u64, Entry)>,
    host: &str,
) {
    loop {
        if carry.is_empty() {
            let (chunk, last_seq) = read_chunk(reader, host);
            if chunk.is_empty() {
                if let Some(seq) = last_seq {
                    let _ = reader.ack(seq);
                    continue;
                }
                break;
            }
            carry = chunk;
        }
        let entries: Vec<Entry> = carry.iter().map(|(_, entry)| entry.clone()).collect();
        let last_seq = carry.last().map(|(seq, _)| *seq).unwrap_or_default();
        match transport.send(&entries).await {
            Ok(()) => {
                if let Err(error) = reader.ack(last_seq) {
                    warn!(message = "Failed to acknowledge drained batch.", %error);
                    break;
                }
                carry.clear();
            }
            Err(error) => {
                debug!(
                    message = "Drain delivery failed; leaving records on disk.",
                    %error,
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::entry::Labels;
    use crate::error::TransportError;

    struct RecordingTransport {
        lines: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
    }

    impl RecordingTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(RecordingTransport {
                lines: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Retriable {
                    endpoint: "recording".into(),
                    reason: "injected failure".into(),
                });
            }
            let mut lines = self.lines.lock().unwrap();
            lines.extend(entries.iter().map(|e| e.line.clone()));
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "recording"
        }
    }

    fn entry(line: &str) -> Entry {
        Entry {
            labels: Labels::new(),
            timestamp: Utc::now(),
            line: line.into(),
        }
    }

    fn client(
        dir: &TempDir,
        transport: Arc<dyn Transport>,
        runtime: &tokio::runtime::Runtime,
    ) -> BufferedClient {
        let queue_config = QueueConfig::from_path(dir.path()).build();
        BufferedClient::new(
            transport,
            "test",
            queue_config,
            BatchSettings {
                wait: Duration::from_millis(20),
                size: 64 * 1024,
            },
            RetryConfig {
                min_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                max_retries: 3,
            },
            runtime.handle().clone(),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn entries_flow_to_the_transport_in_order() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = RecordingTransport::new(0);
        let client = client(&dir, Arc::clone(&transport) as Arc<dyn Transport>, &runtime);

        for i in 0..5 {
            client.handle(entry(&format!("line-{i}"))).unwrap();
        }
        client.stop_wait();

        assert_eq!(
            transport.lines(),
            vec!["line-0", "line-1", "line-2", "line-3", "line-4"]
        );
    }

    #[test]
    fn transient_failures_are_retried() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = RecordingTransport::new(2);
        let client = client(&dir, Arc::clone(&transport) as Arc<dyn Transport>, &runtime);

        client.handle(entry("persistent")).unwrap();
        client.stop_wait();

        assert_eq!(transport.lines(), vec!["persistent"]);
    }

    #[test]
    fn handle_after_stop_is_refused() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = RecordingTransport::new(0);
        let client = client(&dir, transport as Arc<dyn Transport>, &runtime);

        client.stop();
        assert!(matches!(
            client.handle(entry("late")),
            Err(ForwardError::ChainStopped)
        ));
    }

    #[test]
    fn unsent_entries_survive_a_restart() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();

        {
            // A transport that always fails: entries accumulate on disk.
            struct DownTransport;
            #[async_trait]
            impl Transport for DownTransport {
                async fn send(&self, _entries: &[Entry]) -> Result<(), TransportError> {
                    Err(TransportError::Retriable {
                        endpoint: "down".into(),
                        reason: "backend offline".into(),
                    })
                }
                fn endpoint(&self) -> &str {
                    "down"
                }
            }
            let client = client(&dir, Arc::new(DownTransport), &runtime);
            client.handle(entry("survivor-1")).unwrap();
            client.handle(entry("survivor-2")).unwrap();
            client.stop();
        }

        let transport = RecordingTransport::new(0);
        let client = client(&dir, Arc::clone(&transport) as Arc<dyn Transport>, &runtime);
        client.stop_wait();

        assert_eq!(transport.lines(), vec!["survivor-1", "survivor-2"]);
    }
}
