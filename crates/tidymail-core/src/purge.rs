use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::labels::TRASH_LABEL;
use crate::mailbox::{Connector, FetchPart, LabelDelta, Mailbox, SearchCriteria, close_session};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::report::{OperationError, RunSummary};
use crate::senders::{normalize_address, parse_sender};
use crate::stores::SenderDirectoryStore;

const OPERATION: &str = "purge";

/// Moves every message from one sender to the trash.
pub struct SenderPurge {
    connector: Arc<dyn Connector>,
    senders: SenderDirectoryStore,
}

impl SenderPurge {
    pub fn new(connector: Arc<dyn Connector>, senders: SenderDirectoryStore) -> Self {
        Self { connector, senders }
    }

    /// Trash all mail from `address`, expunge once, and drop the address from the
    /// stored directory. A sender with no mail is a no-op that reports no progress.
    ///
    /// Only messages whose parsed `From` address equals `address` are trashed; a
    /// purge of `a@x.com` leaves `data@x.com` alone.
    pub async fn purge(
        &self,
        address: &str,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        let address = normalize_address(address);
        let mut session = self.connector.connect().await?;
        let result = self.run(session.as_mut(), &address, progress).await;
        close_session(session.as_mut()).await;

        let summary = result?;
        if summary.total > 0 && self.senders.remove_sender(&address).await? {
            info!(address = %address, "sender removed from directory");
        }
        Ok(summary)
    }

    async fn run(
        &self,
        session: &mut dyn Mailbox,
        address: &str,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        session.select(self.connector.folder()).await?;
        let candidates = session
            .search(&SearchCriteria::From(address.to_string()))
            .await?;

        // FROM matches substrings, so confirm each hit's parsed sender.
        let mut uids = Vec::with_capacity(candidates.len());
        let mut unreadable = 0;
        for uid in candidates {
            match session.fetch(uid, FetchPart::Header).await {
                Ok(header) => match parse_sender(&header) {
                    Some(sender) if sender.address == address => uids.push(uid),
                    other => {
                        let sender = other.map(|sender| sender.address);
                        debug!(uid, sender = ?sender, "search hit from another sender");
                    }
                },
                Err(err) => {
                    warn!(uid, error = %err, "header fetch failed; leaving message in place");
                    unreadable += 1;
                }
            }
        }

        let mut summary = RunSummary::new(OPERATION, uids.len());
        summary.skipped = unreadable;
        if uids.is_empty() {
            info!(address, "no messages from sender");
            return Ok(summary);
        }

        info!(address, messages = uids.len(), "purging sender");
        let tracker = ProgressTracker::new(progress, uids.len());
        for (index, &uid) in uids.iter().enumerate() {
            match session.store_label(uid, LabelDelta::Add, TRASH_LABEL).await {
                Ok(()) => summary.processed += 1,
                Err(err) => {
                    warn!(uid, error = %err, "failed to trash message");
                    summary.errors += 1;
                }
            }
            tracker.update(index + 1);
        }

        session.expunge().await?;
        info!(
            address,
            trashed = summary.processed,
            errors = summary.errors,
            "purge finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{FailOn, InMemoryMailServer};
    use crate::progress::{NoProgress, ProgressSample};
    use crate::senders::{ParsedSender, SenderDirectory};
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn seeded_store(dir: &TempDir, addresses: &[&str]) -> SenderDirectoryStore {
        let store = SenderDirectoryStore::new(dir.path().join("senders.json"));
        let mut directory = SenderDirectory::new();
        for address in addresses {
            directory.record(ParsedSender {
                address: address.to_string(),
                name: String::new(),
            });
        }
        store.replace(&directory).await.expect("seed store");
        store
    }

    #[tokio::test]
    async fn purge_trashes_every_message_from_sender() {
        let server = InMemoryMailServer::new();
        let spam = [
            server.add_message("From: Spam <spam@x.com>\r\n\r\n1"),
            server.add_message("From: spam@x.com\r\n\r\n2"),
        ];
        let keep = server.add_message("From: friend@y.org\r\n\r\nhi");
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir, &["spam@x.com", "friend@y.org"]).await;

        let samples = Mutex::new(Vec::<ProgressSample>::new());
        let sink = |sample: ProgressSample| samples.lock().expect("lock").push(sample);
        let summary = SenderPurge::new(Arc::new(server.clone()), store.clone())
            .purge("SPAM@x.com", &sink)
            .await
            .expect("purge");

        assert_eq!(summary.total, 2);
        assert_eq!(summary.processed, 2);
        assert!(spam.iter().all(|uid| !server.contains(*uid)));
        assert!(server.contains(keep));
        assert_eq!(server.expunge_count(), 1);
        assert_eq!(samples.into_inner().expect("samples").len(), 2);

        let directory = store.load().await.expect("load");
        assert!(!directory.contains("spam@x.com"));
        assert!(directory.contains("friend@y.org"));
    }

    #[tokio::test]
    async fn substring_matches_from_other_senders_are_kept() {
        let server = InMemoryMailServer::new();
        let target = server.add_message("From: a@x.com\r\n\r\nhi");
        let lookalike = server.add_message("From: Data <data@x.com>\r\n\r\nreport");
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir, &["a@x.com", "data@x.com"]).await;

        let summary = SenderPurge::new(Arc::new(server.clone()), store.clone())
            .purge("a@x.com", &NoProgress)
            .await
            .expect("purge");

        assert_eq!(summary.total, 1);
        assert_eq!(summary.processed, 1);
        assert!(!server.contains(target));
        assert!(server.contains(lookalike));
        assert!(server.labels_of(lookalike).is_empty());
        assert!(store.load().await.expect("load").contains("data@x.com"));
    }

    #[tokio::test]
    async fn store_failures_are_counted_and_purge_continues() {
        let server = InMemoryMailServer::new();
        server.add_message("From: spam@x.com\r\n\r\n1");
        server.fail_on(FailOn::StoreLabel(TRASH_LABEL.to_string()));
        let dir = TempDir::new().expect("temp dir");
        let store = seeded_store(&dir, &[]).await;

        let summary = SenderPurge::new(Arc::new(server.clone()), store)
            .purge("spam@x.com", &NoProgress)
            .await
            .expect("purge");

        assert_eq!(summary.errors, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(server.message_count(), 1);
    }
}
