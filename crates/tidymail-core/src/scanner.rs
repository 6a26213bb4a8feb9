//! Concurrent sender-directory scan.
//!
//! The folder's UIDs are split into fixed-size batches and handed to a bounded pool
//! of tasks. Each task opens its own session, downloads only the header section of
//! its messages, and returns a partial [`SenderDirectory`]. The partials are merged
//! once every batch is in and the result replaces the stored directory.
//!
//! Cancellation is checked each time a batch result is drained. A cancelled scan
//! dispatches nothing further, lets in-flight batches finish in the background,
//! discards their results, and leaves the stored directory untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanSettings;
use crate::mailbox::{Connector, FetchPart, SearchCriteria, Uid, close_session};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::report::{OperationError, Outcome};
use crate::senders::{SenderDirectory, parse_sender};
use crate::stores::SenderDirectoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub outcome: Outcome,
    pub messages: usize,
    pub batches: usize,
    pub batches_completed: usize,
    pub senders: usize,
    /// Messages whose header could not be fetched or had no usable sender.
    pub skipped: usize,
}

struct BatchResult {
    directory: SenderDirectory,
    skipped: usize,
}

pub struct SenderScanner {
    connector: Arc<dyn Connector>,
    store: SenderDirectoryStore,
    settings: ScanSettings,
}

impl SenderScanner {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: SenderDirectoryStore,
        settings: ScanSettings,
    ) -> Self {
        Self {
            connector,
            store,
            settings,
        }
    }

    pub async fn scan(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<ScanReport, OperationError> {
        let uids = self.list_uids().await?;
        let batches: Vec<Vec<Uid>> = uids
            .chunks(self.settings.batch_size.max(1))
            .map(<[Uid]>::to_vec)
            .collect();
        let mut report = ScanReport {
            outcome: Outcome::Success,
            messages: uids.len(),
            batches: batches.len(),
            batches_completed: 0,
            senders: 0,
            skipped: 0,
        };
        info!(
            messages = report.messages,
            batches = report.batches,
            workers = self.settings.workers,
            "starting sender scan"
        );

        let tracker = ProgressTracker::new(progress, batches.len());
        let completed = Arc::new(AtomicUsize::new(0));
        let mut pending = batches.into_iter();
        let mut running = JoinSet::new();
        let mut partials = Vec::with_capacity(report.batches);

        for batch in pending.by_ref().take(self.settings.workers.max(1)) {
            self.spawn_batch(&mut running, batch, completed.clone());
        }

        while let Some(joined) = running.join_next().await {
            let batch = match joined {
                Ok(Ok(batch)) => batch,
                Ok(Err(err)) => {
                    running.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    running.abort_all();
                    return Err(OperationError::Worker(join_err.to_string()));
                }
            };
            report.skipped += batch.skipped;
            partials.push(batch.directory);
            tracker.update(completed.load(Ordering::SeqCst));

            if cancel.is_cancelled() {
                report.batches_completed = partials.len();
                info!(
                    batches_completed = report.batches_completed,
                    in_flight = running.len(),
                    "sender scan cancelled; directory left unchanged"
                );
                running.detach_all();
                report.outcome = Outcome::Cancelled;
                return Ok(report);
            }

            if let Some(next) = pending.next() {
                self.spawn_batch(&mut running, next, completed.clone());
            }
        }

        report.batches_completed = partials.len();
        let directory = SenderDirectory::merge_all(partials);
        report.senders = directory.len();
        self.store.replace(&directory).await?;

        info!(
            senders = report.senders,
            skipped = report.skipped,
            "sender scan finished"
        );
        Ok(report)
    }

    async fn list_uids(&self) -> Result<Vec<Uid>, OperationError> {
        let mut session = self.connector.connect().await?;
        let result = async {
            session.select(self.connector.folder()).await?;
            session.search(&SearchCriteria::All).await
        }
        .await;
        close_session(session.as_mut()).await;
        Ok(result?)
    }

    fn spawn_batch(
        &self,
        running: &mut JoinSet<Result<BatchResult, OperationError>>,
        batch: Vec<Uid>,
        completed: Arc<AtomicUsize>,
    ) {
        let connector = self.connector.clone();
        running.spawn(async move {
            let result = scan_batch(connector.as_ref(), &batch).await;
            completed.fetch_add(1, Ordering::SeqCst);
            result
        });
    }
}

async fn scan_batch(connector: &dyn Connector, uids: &[Uid]) -> Result<BatchResult, OperationError> {
    let mut session = connector.connect().await?;
    if let Err(err) = session.select(connector.folder()).await {
        close_session(session.as_mut()).await;
        return Err(err.into());
    }

    let mut directory = SenderDirectory::new();
    let mut skipped = 0;
    for &uid in uids {
        let header = match session.fetch(uid, FetchPart::Header).await {
            Ok(header) => header,
            Err(err) => {
                warn!(uid, error = %err, "header fetch failed; skipping message");
                skipped += 1;
                continue;
            }
        };
        match parse_sender(&header) {
            Some(sender) => directory.record(sender),
            None => {
                debug!(uid, "no usable sender in header");
                skipped += 1;
            }
        }
    }

    close_session(session.as_mut()).await;
    Ok(BatchResult { directory, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{FailOn, InMemoryMailServer};
    use crate::progress::{NoProgress, ProgressSample};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn seed(server: &InMemoryMailServer, senders: &[&str]) -> Vec<Uid> {
        senders
            .iter()
            .map(|from| server.add_message(format!("From: {from}\r\nSubject: s\r\n\r\nbody")))
            .collect()
    }

    fn scanner(server: &InMemoryMailServer, dir: &TempDir, batch_size: usize, workers: usize) -> SenderScanner {
        SenderScanner::new(
            Arc::new(server.clone()),
            SenderDirectoryStore::new(dir.path().join("senders.json")),
            ScanSettings {
                batch_size,
                workers,
            },
        )
    }

    #[tokio::test]
    async fn scan_counts_senders_across_batches() {
        let server = InMemoryMailServer::new();
        seed(
            &server,
            &[
                "Alice <alice@x.com>",
                "bob@x.com",
                "ALICE@x.com",
                "Undisclosed recipients:;",
                "Carol <carol@y.org>",
            ],
        );
        let dir = TempDir::new().expect("temp dir");
        let scanner = scanner(&server, &dir, 2, 2);

        let samples = Mutex::new(Vec::<ProgressSample>::new());
        let sink = |sample: ProgressSample| samples.lock().expect("lock").push(sample);
        let report = scanner
            .scan(&CancellationToken::new(), &sink)
            .await
            .expect("scan");

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.messages, 5);
        assert_eq!(report.batches, 3);
        assert_eq!(report.senders, 3);
        assert_eq!(report.skipped, 1);

        let stored = scanner.store.load().await.expect("load");
        assert_eq!(stored.get("alice@x.com").map(|r| r.frequency), Some(2));
        assert_eq!(stored.get("alice@x.com").map(|r| r.name.as_str()), Some("Alice"));

        let samples = samples.into_inner().expect("samples");
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|sample| sample.completed > 0));
        assert_eq!(samples.last().map(|s| s.completed), Some(3));
        // one listing session plus one per batch, all closed
        assert_eq!(server.sessions_opened(), 4);
        assert_eq!(server.sessions_closed(), 4);
    }

    #[tokio::test]
    async fn connection_failure_aborts_scan_without_writing() {
        let server = InMemoryMailServer::new();
        seed(&server, &["a@x.com", "b@x.com"]);
        let dir = TempDir::new().expect("temp dir");
        let scanner = scanner(&server, &dir, 1, 1);
        server.fail_on(FailOn::Auth);

        let err = scanner
            .scan(&CancellationToken::new(), &NoProgress)
            .await
            .expect_err("auth failure");
        assert!(matches!(err, OperationError::Connect(_)));
        assert!(!dir.path().join("senders.json").exists());
    }

    #[tokio::test]
    async fn empty_folder_writes_empty_directory() {
        let server = InMemoryMailServer::new();
        let dir = TempDir::new().expect("temp dir");
        let scanner = scanner(&server, &dir, 10, 10);

        let report = scanner
            .scan(&CancellationToken::new(), &NoProgress)
            .await
            .expect("scan");
        assert_eq!(report.batches, 0);
        assert!(scanner.store.load().await.expect("load").is_empty());
        assert!(dir.path().join("senders.json").exists());
    }
}
