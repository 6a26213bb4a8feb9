//! Undo organizer work, remotely (labels) or locally (store files).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::labels::OrganizerKind;
use crate::mailbox::{Connector, LabelDelta, Mailbox, SearchCriteria, Uid, close_session};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::report::{OperationError, RunSummary};
use crate::stores::{CategoryStore, RuleStore, SenderDirectoryStore, StoreError};

const OPERATION: &str = "reset";

/// Strips every label an organizer applied, including its checked marker, so the
/// next run sees the messages as new.
pub struct LabelReset {
    connector: Arc<dyn Connector>,
}

impl LabelReset {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub async fn reset(
        &self,
        kind: OrganizerKind,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        let mut session = self.connector.connect().await?;
        let result = self.run(session.as_mut(), kind, progress).await;
        close_session(session.as_mut()).await;
        result
    }

    async fn run(
        &self,
        session: &mut dyn Mailbox,
        kind: OrganizerKind,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        session.select(self.connector.folder()).await?;
        let checked = session.search(&kind.checked()).await?;
        let mut summary = RunSummary::new(OPERATION, checked.len());
        if checked.is_empty() {
            info!(%kind, "no checked messages to reset");
            return Ok(summary);
        }

        let labels_by_uid = namespace_labels(session, kind, &checked).await?;
        info!(%kind, messages = checked.len(), "resetting organizer labels");

        let tracker = ProgressTracker::new(progress, checked.len());
        for (index, uid) in checked.iter().enumerate() {
            let mut failed = false;
            for label in labels_by_uid.get(uid).into_iter().flatten() {
                if let Err(err) = session.store_label(*uid, LabelDelta::Remove, label).await {
                    warn!(uid, label = %label, error = %err, "failed to remove label");
                    failed = true;
                }
            }
            if failed {
                summary.errors += 1;
            } else {
                summary.processed += 1;
            }
            tracker.update(index + 1);
        }

        info!(
            %kind,
            reset = summary.processed,
            errors = summary.errors,
            "label reset finished"
        );
        Ok(summary)
    }
}

/// Namespace labels carried by each of `uids`, found with one search per label.
async fn namespace_labels(
    session: &mut dyn Mailbox,
    kind: OrganizerKind,
    uids: &[Uid],
) -> Result<BTreeMap<Uid, BTreeSet<String>>, OperationError> {
    let wanted: BTreeSet<Uid> = uids.iter().copied().collect();
    let mut labels = session.list_labels(&kind.namespace()).await?;
    let checked = kind.checked_label();
    if !labels.contains(&checked) {
        labels.push(checked);
    }

    let mut by_uid: BTreeMap<Uid, BTreeSet<String>> = BTreeMap::new();
    for label in labels.into_iter().filter(|label| kind.owns_label(label)) {
        let carriers = session
            .search(&SearchCriteria::WithLabel(label.clone()))
            .await?;
        debug!(label = %label, carriers = carriers.len(), "label carriers found");
        for uid in carriers.into_iter().filter(|uid| wanted.contains(uid)) {
            by_uid.entry(uid).or_default().insert(label.clone());
        }
    }
    Ok(by_uid)
}

/// Local store that `reset-local` can clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTarget {
    SenderLabels,
    Unsubscribed,
    Categories,
    Senders,
    All,
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocalTarget::SenderLabels => "sender-labels",
            LocalTarget::Unsubscribed => "unsubscribed",
            LocalTarget::Categories => "categories",
            LocalTarget::Senders => "senders",
            LocalTarget::All => "all",
        })
    }
}

impl FromStr for LocalTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sender-labels" | "labels" => Ok(LocalTarget::SenderLabels),
            "unsubscribed" => Ok(LocalTarget::Unsubscribed),
            "categories" => Ok(LocalTarget::Categories),
            "senders" | "sender-list" => Ok(LocalTarget::Senders),
            "all" => Ok(LocalTarget::All),
            other => Err(format!("unknown local store: {other}")),
        }
    }
}

/// The local JSON stores, grouped for resetting.
pub struct LocalReset {
    pub rules: RuleStore,
    pub categories: CategoryStore,
    pub senders: SenderDirectoryStore,
}

impl LocalReset {
    pub async fn reset(&self, target: LocalTarget) -> Result<(), StoreError> {
        match target {
            LocalTarget::SenderLabels => self.rules.clear_labels().await?,
            LocalTarget::Unsubscribed => self.rules.clear_unsubscribed().await?,
            LocalTarget::Categories => self.categories.clear().await?,
            LocalTarget::Senders => self.senders.clear().await?,
            LocalTarget::All => {
                self.rules.clear_labels().await?;
                self.rules.clear_unsubscribed().await?;
                self.categories.clear().await?;
                self.senders.clear().await?;
            }
        }
        info!(%target, "local store reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{FailOn, InMemoryMailServer};
    use crate::progress::NoProgress;
    use tempfile::TempDir;

    async fn label(server: &InMemoryMailServer, uid: Uid, labels: &[String]) {
        let mut session = server.connect().await.expect("connect");
        session.select(server.folder()).await.expect("select");
        for label in labels {
            session
                .store_label(uid, LabelDelta::Add, label)
                .await
                .expect("store");
        }
        close_session(session.as_mut()).await;
    }

    #[tokio::test]
    async fn reset_strips_only_the_kinds_namespace() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message("From: a@x.com\r\n\r\nhi");
        let std = OrganizerKind::Standard;
        let ai = OrganizerKind::Ai;
        label(
            &server,
            uid,
            &[
                std.category_label("Finance"),
                std.checked_label(),
                ai.category_label("Travel"),
                ai.checked_label(),
                "Personal".to_string(),
            ],
        )
        .await;

        let summary = LabelReset::new(Arc::new(server.clone()))
            .reset(std, &NoProgress)
            .await
            .expect("reset");

        assert_eq!(summary.processed, 1);
        assert_eq!(
            server.labels_of(uid),
            vec![
                ai.checked_label(),
                ai.category_label("Travel"),
                "Personal".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unchecked_messages_keep_their_labels() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message("From: a@x.com\r\n\r\nhi");
        let kind = OrganizerKind::Ai;
        label(&server, uid, &[kind.category_label("Travel")]).await;

        let summary = LabelReset::new(Arc::new(server.clone()))
            .reset(kind, &NoProgress)
            .await
            .expect("reset");

        assert_eq!(summary.total, 0);
        assert_eq!(server.labels_of(uid), vec![kind.category_label("Travel")]);
    }

    #[tokio::test]
    async fn failed_removal_counts_an_error() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message("From: a@x.com\r\n\r\nhi");
        let kind = OrganizerKind::Standard;
        label(&server, uid, &[kind.category_label("Finance"), kind.checked_label()]).await;
        server.fail_on(FailOn::StoreLabel(kind.category_label("Finance")));

        let summary = LabelReset::new(Arc::new(server.clone()))
            .reset(kind, &NoProgress)
            .await
            .expect("reset");

        assert_eq!(summary.errors, 1);
        assert_eq!(server.labels_of(uid), vec![kind.category_label("Finance")]);
    }

    #[tokio::test]
    async fn local_reset_all_clears_every_store() {
        let dir = TempDir::new().expect("temp dir");
        let local = LocalReset {
            rules: RuleStore::new(
                dir.path().join("sender_labels.json"),
                dir.path().join("unsubscribed.json"),
            ),
            categories: CategoryStore::new(dir.path().join("categories.json")),
            senders: SenderDirectoryStore::new(dir.path().join("senders.json")),
        };
        local.rules.assign_label("a@x.com", "Finance").await.expect("assign");
        local.rules.unsubscribe("b@x.com").await.expect("unsubscribe");
        local.categories.add("Travel").await.expect("add");

        local.reset(LocalTarget::All).await.expect("reset");

        assert!(local.rules.addresses_for_label("Finance").await.expect("load").is_empty());
        assert!(local.rules.load_unsubscribed().await.expect("load").is_empty());
        assert!(local.categories.load().await.expect("load").is_empty());
        assert!(local.senders.load().await.expect("load").is_empty());
    }

    #[test]
    fn local_target_parses_aliases() {
        assert_eq!("labels".parse::<LocalTarget>(), Ok(LocalTarget::SenderLabels));
        assert_eq!("ALL".parse::<LocalTarget>(), Ok(LocalTarget::All));
        assert!("everything".parse::<LocalTarget>().is_err());
    }
}
