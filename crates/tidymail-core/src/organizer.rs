//! Rule-based organizer: labels or trashes unchecked messages by sender address.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::labels::{
    ApplyOutcome, LabelApplication, OrganizerKind, apply_with_marker, mark_checked,
    mark_then_trash,
};
use crate::mailbox::{Connector, FetchPart, Mailbox, Uid, close_session};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::report::{OperationError, RunSummary};
use crate::rules::{RulePolicy, RuleTable};
use crate::senders::parse_sender;
use crate::stores::{DiagnosticLog, DiagnosticRecord, RuleStore};

const OPERATION: &str = "organize";
const KIND: OrganizerKind = OrganizerKind::Standard;

pub struct RuleOrganizer {
    connector: Arc<dyn Connector>,
    rules: RuleStore,
    diagnostics: DiagnosticLog,
}

impl RuleOrganizer {
    pub fn new(connector: Arc<dyn Connector>, rules: RuleStore, diagnostics: DiagnosticLog) -> Self {
        Self {
            connector,
            rules,
            diagnostics,
        }
    }

    /// Apply the stored rules to every message without the standard checked marker.
    ///
    /// Messages are handled one at a time in server order. Work already done is kept
    /// when the run is cancelled.
    pub async fn organize(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        let table = RuleTable::load(&self.rules).await?;
        let mut session = self.connector.connect().await?;
        let result = self.run(session.as_mut(), &table, cancel, progress).await;
        close_session(session.as_mut()).await;
        result
    }

    async fn run(
        &self,
        session: &mut dyn Mailbox,
        table: &RuleTable,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        session.select(self.connector.folder()).await?;
        let uids = session.search(&KIND.unchecked()).await?;

        let mut summary = RunSummary::new(OPERATION, uids.len());
        let tracker = ProgressTracker::new(progress, uids.len());
        info!(messages = uids.len(), rules = table.len(), "starting rule organize");

        for (index, &uid) in uids.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(processed = summary.processed, "rule organize cancelled");
                return Ok(summary.cancelled());
            }
            self.process(session, table, uid, &mut summary).await;
            tracker.update(index + 1);
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            errors = summary.errors,
            "rule organize finished"
        );
        Ok(summary)
    }

    async fn process(
        &self,
        session: &mut dyn Mailbox,
        table: &RuleTable,
        uid: Uid,
        summary: &mut RunSummary,
    ) {
        let sender = match session.fetch(uid, FetchPart::Header).await {
            Ok(header) => parse_sender(&header),
            Err(err) => {
                warn!(uid, error = %err, "header fetch failed; skipping message");
                summary.skipped += 1;
                return;
            }
        };
        let address = sender.map(|sender| sender.address);

        let application = match address.as_deref().and_then(|a| table.policy_for(a)) {
            Some(RulePolicy::Label(label)) => {
                apply_with_marker(session, KIND, uid, &KIND.category_label(label)).await
            }
            Some(RulePolicy::Unsubscribed) => mark_then_trash(session, KIND, uid).await,
            None => {
                debug!(uid, address = ?address, "no rule for sender");
                mark_checked(session, KIND, uid).await
            }
        };

        if application.is_applied() {
            summary.processed += 1;
        } else {
            summary.errors += 1;
            self.record_failure(uid, address, application).await;
        }
    }

    async fn record_failure(&self, uid: Uid, address: Option<String>, application: LabelApplication) {
        let outcome = match application.outcome {
            ApplyOutcome::CheckedFailed => "checked_marker_error",
            _ => "label_error",
        };
        let mut record = DiagnosticRecord::new(KIND, outcome);
        record.sender = address;
        record.label_calls = application.steps;
        if let Err(err) = self.diagnostics.record(uid, record).await {
            warn!(uid, error = %err, "failed to write diagnostics record");
        }
    }
}
