pub mod imap;
pub mod memory;

pub use imap::ImapConnector;
pub use memory::{FailOn, InMemoryMailServer};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub type Uid = u32;

/// Which part of a message to download. Neither variant marks the message as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPart {
    Header,
    Full,
}

impl FetchPart {
    pub fn as_query(&self) -> &'static str {
        match self {
            FetchPart::Header => "RFC822.HEADER",
            FetchPart::Full => "BODY.PEEK[]",
        }
    }
}

impl fmt::Display for FetchPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchPart::Header => f.write_str("header"),
            FetchPart::Full => f.write_str("full message"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelDelta {
    Add,
    Remove,
}

impl LabelDelta {
    fn sign(&self) -> char {
        match self {
            LabelDelta::Add => '+',
            LabelDelta::Remove => '-',
        }
    }

    /// Item argument of a `UID STORE` that changes Gmail labels.
    pub fn store_query(&self, label: &str) -> String {
        format!("{}X-GM-LABELS ({})", self.sign(), quote_label(label))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    From(String),
    WithLabel(String),
    WithoutLabel(String),
}

impl SearchCriteria {
    pub fn to_query(&self) -> String {
        match self {
            SearchCriteria::All => "ALL".to_string(),
            SearchCriteria::From(address) => format!("FROM {}", quote(address)),
            SearchCriteria::WithLabel(label) => format!("X-GM-LABELS {}", quote_label(label)),
            SearchCriteria::WithoutLabel(label) => {
                format!("NOT X-GM-LABELS {}", quote_label(label))
            }
        }
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// System labels such as `\Trash` are atoms and go on the wire unquoted.
fn quote_label(label: &str) -> String {
    if label.starts_with('\\') && !label.contains(' ') {
        label.to_string()
    } else {
        quote(label)
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not reach mail server after {attempts} attempts: {message}")]
    Connection { attempts: u32, message: String },
    #[error("mail server rejected credentials: {0}")]
    Auth(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("failed to select {folder}: {message}")]
    Select { folder: String, message: String },
    #[error("search failed: {0}")]
    Search(String),
    #[error("fetch of uid {uid} failed: {message}")]
    Fetch { uid: Uid, message: String },
    #[error("server returned no {part} for uid {uid}")]
    MissingPart { uid: Uid, part: FetchPart },
    #[error("storing label {label} on uid {uid} failed: {message}")]
    Store {
        uid: Uid,
        label: String,
        message: String,
    },
    #[error("listing labels failed: {0}")]
    List(String),
    #[error("expunge failed: {0}")]
    Expunge(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("logout failed: {0}")]
    Logout(String),
}

/// An authenticated session on one account. Never shared between tasks.
#[async_trait]
pub trait Mailbox: Send {
    /// Select `folder`, returning its message count.
    async fn select(&mut self, folder: &str) -> Result<u32, MailboxError>;

    /// UIDs matching `criteria`, ascending.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError>;

    async fn fetch(&mut self, uid: Uid, part: FetchPart) -> Result<Vec<u8>, MailboxError>;

    async fn store_label(
        &mut self,
        uid: Uid,
        delta: LabelDelta,
        label: &str,
    ) -> Result<(), MailboxError>;

    /// Every label whose name starts with `prefix`, sorted.
    async fn list_labels(&mut self, prefix: &str) -> Result<Vec<String>, MailboxError>;

    async fn expunge(&mut self) -> Result<(), MailboxError>;

    async fn close(&mut self) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens fresh sessions against the configured account.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, ConnectError>;

    /// Folder every operation works on.
    fn folder(&self) -> &str;
}

/// Close the selected folder and log out. Failures are logged; the session is gone either way.
pub async fn close_session(mailbox: &mut dyn Mailbox) {
    if let Err(err) = mailbox.close().await {
        warn!(error = %err, "closing folder failed");
    }
    if let Err(err) = mailbox.logout().await {
        warn!(error = %err, "logout failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_render_gmail_search_syntax() {
        assert_eq!(SearchCriteria::All.to_query(), "ALL");
        assert_eq!(
            SearchCriteria::From("a@example.com".into()).to_query(),
            "FROM \"a@example.com\""
        );
        assert_eq!(
            SearchCriteria::WithoutLabel("Email Organizer/AI Organizer/AI Checked Emails".into())
                .to_query(),
            "NOT X-GM-LABELS \"Email Organizer/AI Organizer/AI Checked Emails\""
        );
    }

    #[test]
    fn store_query_leaves_system_labels_bare() {
        assert_eq!(
            LabelDelta::Add.store_query("\\Trash"),
            "+X-GM-LABELS (\\Trash)"
        );
        assert_eq!(
            LabelDelta::Remove.store_query("Say \"hi\""),
            "-X-GM-LABELS (\"Say \\\"hi\\\"\")"
        );
    }
}
