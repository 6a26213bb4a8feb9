//! Every label name the organizers read or write is built and parsed here.
//!
//! Labels double as the only persisted state: a message carrying an organizer's
//! checked marker has been processed by that organizer, anything else is still work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::mailbox::{LabelDelta, Mailbox, MailboxError, SearchCriteria, Uid};

const ROOT: &str = "Email Organizer";

/// Gmail system label that moves a message to the trash.
pub const TRASH_LABEL: &str = "\\Trash";
/// Category applied when the classifier declines to pick one.
pub const UNSURE_CATEGORY: &str = "Unsure";
/// Classifier answer meaning "none of the categories fit".
pub const NONE_SENTINEL: &str = "NONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizerKind {
    Standard,
    Ai,
}

impl OrganizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizerKind::Standard => "standard",
            OrganizerKind::Ai => "ai",
        }
    }

    /// Label prefix shared by everything this organizer applies, including the trailing `/`.
    pub fn namespace(&self) -> String {
        match self {
            OrganizerKind::Standard => format!("{ROOT}/Standard Organizer/"),
            OrganizerKind::Ai => format!("{ROOT}/AI Organizer/"),
        }
    }

    pub fn checked_label(&self) -> String {
        match self {
            OrganizerKind::Standard => format!("{}Checked Emails", self.namespace()),
            OrganizerKind::Ai => format!("{}AI Checked Emails", self.namespace()),
        }
    }

    pub fn category_label(&self, category: &str) -> String {
        format!("{}{}", self.namespace(), category)
    }

    pub fn owns_label(&self, label: &str) -> bool {
        label.starts_with(&self.namespace())
    }

    /// Messages this organizer has not processed yet.
    pub fn unchecked(&self) -> SearchCriteria {
        SearchCriteria::WithoutLabel(self.checked_label())
    }

    /// Messages this organizer has already processed.
    pub fn checked(&self) -> SearchCriteria {
        SearchCriteria::WithLabel(self.checked_label())
    }
}

impl fmt::Display for OrganizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganizerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" | "rules" => Ok(OrganizerKind::Standard),
            "ai" => Ok(OrganizerKind::Ai),
            other => Err(format!("unknown organizer kind: {other}")),
        }
    }
}

/// One label mutation and what the server said about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelStep {
    pub label: String,
    pub delta: LabelDelta,
    pub ok: bool,
    pub response: String,
}

impl LabelStep {
    fn record(label: &str, delta: LabelDelta, result: &Result<(), MailboxError>) -> Self {
        Self {
            label: label.to_string(),
            delta,
            ok: result.is_ok(),
            response: match result {
                Ok(()) => "OK".to_string(),
                Err(err) => err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Both the decision label and the checked marker are on the message.
    Applied,
    /// The decision label failed; the message stays unchecked.
    DecisionFailed,
    /// The decision label is on but the checked marker is not.
    CheckedFailed,
}

/// Result of a two-step label application, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelApplication {
    pub outcome: ApplyOutcome,
    pub steps: Vec<LabelStep>,
}

impl LabelApplication {
    pub fn is_applied(&self) -> bool {
        self.outcome == ApplyOutcome::Applied
    }
}

/// Add `label` then the kind's checked marker, stopping at the first failure.
pub async fn apply_with_marker(
    mailbox: &mut dyn Mailbox,
    kind: OrganizerKind,
    uid: Uid,
    label: &str,
) -> LabelApplication {
    let mut steps = Vec::with_capacity(2);

    let result = mailbox.store_label(uid, LabelDelta::Add, label).await;
    steps.push(LabelStep::record(label, LabelDelta::Add, &result));
    if let Err(err) = result {
        warn!(uid, label, error = %err, "label mutation failed; leaving message unchecked");
        return LabelApplication {
            outcome: ApplyOutcome::DecisionFailed,
            steps,
        };
    }

    let checked = kind.checked_label();
    let result = mailbox.store_label(uid, LabelDelta::Add, &checked).await;
    steps.push(LabelStep::record(&checked, LabelDelta::Add, &result));
    let outcome = match result {
        Ok(()) => ApplyOutcome::Applied,
        Err(err) => {
            warn!(uid, label, error = %err, "checked marker failed after label was applied");
            ApplyOutcome::CheckedFailed
        }
    };

    LabelApplication { outcome, steps }
}

/// Mark the message checked, then trash it.
///
/// The marker goes first because a trashed message can leave the selected folder,
/// after which it can no longer be marked. If trashing fails the marker is taken
/// off again so the next run retries the message.
pub async fn mark_then_trash(
    mailbox: &mut dyn Mailbox,
    kind: OrganizerKind,
    uid: Uid,
) -> LabelApplication {
    let mut steps = Vec::with_capacity(3);
    let checked = kind.checked_label();

    let result = mailbox.store_label(uid, LabelDelta::Add, &checked).await;
    steps.push(LabelStep::record(&checked, LabelDelta::Add, &result));
    if let Err(err) = result {
        warn!(uid, error = %err, "checked marker failed; message not trashed");
        return LabelApplication {
            outcome: ApplyOutcome::CheckedFailed,
            steps,
        };
    }

    let result = mailbox.store_label(uid, LabelDelta::Add, TRASH_LABEL).await;
    steps.push(LabelStep::record(TRASH_LABEL, LabelDelta::Add, &result));
    if let Err(err) = result {
        warn!(uid, error = %err, "trash failed; removing checked marker");
        let result = mailbox.store_label(uid, LabelDelta::Remove, &checked).await;
        steps.push(LabelStep::record(&checked, LabelDelta::Remove, &result));
        if let Err(err) = result {
            warn!(uid, error = %err, "checked marker could not be removed after failed trash");
        }
        return LabelApplication {
            outcome: ApplyOutcome::DecisionFailed,
            steps,
        };
    }

    LabelApplication {
        outcome: ApplyOutcome::Applied,
        steps,
    }
}

/// Add only the checked marker.
pub async fn mark_checked(
    mailbox: &mut dyn Mailbox,
    kind: OrganizerKind,
    uid: Uid,
) -> LabelApplication {
    let checked = kind.checked_label();
    let result = mailbox.store_label(uid, LabelDelta::Add, &checked).await;
    let step = LabelStep::record(&checked, LabelDelta::Add, &result);
    let outcome = match result {
        Ok(()) => ApplyOutcome::Applied,
        Err(err) => {
            warn!(uid, error = %err, "checked marker failed");
            ApplyOutcome::CheckedFailed
        }
    };
    LabelApplication {
        outcome,
        steps: vec![step],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::memory::InMemoryMailServer;
    use crate::mailbox::{Connector, FailOn};

    #[test]
    fn label_names_match_gmail_layout() {
        assert_eq!(
            OrganizerKind::Standard.checked_label(),
            "Email Organizer/Standard Organizer/Checked Emails"
        );
        assert_eq!(
            OrganizerKind::Ai.checked_label(),
            "Email Organizer/AI Organizer/AI Checked Emails"
        );
        assert_eq!(
            OrganizerKind::Ai.category_label("Travel"),
            "Email Organizer/AI Organizer/Travel"
        );
    }

    #[test]
    fn namespaces_do_not_overlap() {
        let ai_label = OrganizerKind::Ai.category_label("Finance");
        assert!(OrganizerKind::Ai.owns_label(&ai_label));
        assert!(!OrganizerKind::Standard.owns_label(&ai_label));
        assert!(!OrganizerKind::Ai.owns_label("Email Organizer/Standard Organizer/Finance"));
    }

    #[test]
    fn kind_parses_from_cli_names() {
        assert_eq!("AI".parse::<OrganizerKind>(), Ok(OrganizerKind::Ai));
        assert_eq!(
            "standard".parse::<OrganizerKind>(),
            Ok(OrganizerKind::Standard)
        );
        assert!("other".parse::<OrganizerKind>().is_err());
    }

    #[tokio::test]
    async fn failed_decision_label_leaves_message_unchecked() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(b"From: a@example.com\r\n\r\nhi".to_vec());
        let label = OrganizerKind::Ai.category_label("Finance");
        server.fail_on(FailOn::StoreLabel(label.clone()));

        let mut mailbox = server.connect().await.expect("connect");
        let application = apply_with_marker(mailbox.as_mut(), OrganizerKind::Ai, uid, &label).await;

        assert_eq!(application.outcome, ApplyOutcome::DecisionFailed);
        assert_eq!(application.steps.len(), 1);
        assert!(!application.steps[0].ok);
        assert!(server.labels_of(uid).is_empty());
    }

    #[tokio::test]
    async fn marker_failure_keeps_category() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(b"From: a@example.com\r\n\r\nhi".to_vec());
        let kind = OrganizerKind::Ai;
        server.fail_on(FailOn::StoreLabel(kind.checked_label()));

        let mut mailbox = server.connect().await.expect("connect");
        let label = kind.category_label("Finance");
        let application = apply_with_marker(mailbox.as_mut(), kind, uid, &label).await;

        assert_eq!(application.outcome, ApplyOutcome::CheckedFailed);
        assert_eq!(server.labels_of(uid), vec![label]);
    }
}
