//! In-process mail server with Gmail label semantics, used by tests.
//!
//! Trashed messages drop out of searches and can no longer be fetched or labelled
//! from the selected folder; `expunge` deletes them for good.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    ConnectError, Connector, FetchPart, LabelDelta, Mailbox, MailboxError, SearchCriteria, Uid,
};
use crate::labels::TRASH_LABEL;

pub const DEFAULT_FOLDER: &str = "[Gmail]/All Mail";

/// Failures the server can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOn {
    /// The next `n` connection attempts fail with a connection error.
    Connect(u32),
    /// Every login is rejected.
    Auth,
    Search,
    Fetch(Uid),
    /// Any store of this exact label fails.
    StoreLabel(String),
    Expunge,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Vec<u8>,
    labels: BTreeSet<String>,
}

impl StoredMessage {
    fn trashed(&self) -> bool {
        self.labels.contains(TRASH_LABEL)
    }

    fn from_header(&self) -> String {
        header_value(&self.raw, "from").unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    messages: BTreeMap<Uid, StoredMessage>,
    known_labels: BTreeSet<String>,
    next_uid: Uid,
    failures: Vec<FailOn>,
    sessions_opened: usize,
    sessions_closed: usize,
    expunges: usize,
    store_calls: usize,
}

#[derive(Debug, Clone)]
pub struct InMemoryMailServer {
    state: Arc<Mutex<ServerState>>,
    folder: String,
}

impl Default for InMemoryMailServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                next_uid: 1,
                ..Default::default()
            })),
            folder: DEFAULT_FOLDER.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a raw RFC 5322 message and return its UID.
    pub fn add_message(&self, raw: impl Into<Vec<u8>>) -> Uid {
        let mut state = self.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.messages.insert(
            uid,
            StoredMessage {
                raw: raw.into(),
                labels: BTreeSet::new(),
            },
        );
        uid
    }

    pub fn fail_on(&self, failure: FailOn) {
        self.lock().failures.push(failure);
    }

    /// Labels on `uid`, sorted; empty for unknown UIDs.
    pub fn labels_of(&self, uid: Uid) -> Vec<String> {
        self.lock()
            .messages
            .get(&uid)
            .map(|message| message.labels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_trashed(&self, uid: Uid) -> bool {
        self.lock()
            .messages
            .get(&uid)
            .is_some_and(StoredMessage::trashed)
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.lock().messages.contains_key(&uid)
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.lock().sessions_closed
    }

    pub fn expunge_count(&self) -> usize {
        self.lock().expunges
    }

    pub fn store_calls(&self) -> usize {
        self.lock().store_calls
    }
}

#[async_trait]
impl Connector for InMemoryMailServer {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, ConnectError> {
        let mut state = self.lock();
        if state.failures.contains(&FailOn::Auth) {
            return Err(ConnectError::Auth("invalid credentials".into()));
        }
        if let Some(index) = state
            .failures
            .iter()
            .position(|failure| matches!(failure, FailOn::Connect(n) if *n > 0))
        {
            if let FailOn::Connect(remaining) = &mut state.failures[index] {
                *remaining -= 1;
            }
            return Err(ConnectError::Connection {
                attempts: 1,
                message: "connection refused".into(),
            });
        }
        state.sessions_opened += 1;
        drop(state);

        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            folder: self.folder.clone(),
            selected: false,
            open: true,
        }))
    }

    fn folder(&self) -> &str {
        &self.folder
    }
}

struct MemorySession {
    state: Arc<Mutex<ServerState>>,
    folder: String,
    selected: bool,
    open: bool,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_selected(&self) -> Result<(), String> {
        if !self.open {
            Err("session closed".into())
        } else if !self.selected {
            Err("no folder selected".into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Mailbox for MemorySession {
    async fn select(&mut self, folder: &str) -> Result<u32, MailboxError> {
        if folder != self.folder {
            return Err(MailboxError::Select {
                folder: folder.to_string(),
                message: "no such folder".into(),
            });
        }
        self.selected = true;
        let state = self.lock();
        let visible = state.messages.values().filter(|m| !m.trashed()).count();
        Ok(visible as u32)
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError> {
        self.require_selected().map_err(MailboxError::Search)?;
        let state = self.lock();
        if state.failures.contains(&FailOn::Search) {
            return Err(MailboxError::Search("server busy".into()));
        }

        let uids = state
            .messages
            .iter()
            .filter(|(_, message)| !message.trashed())
            .filter(|(_, message)| match criteria {
                SearchCriteria::All => true,
                SearchCriteria::From(address) => message
                    .from_header()
                    .to_ascii_lowercase()
                    .contains(&address.to_ascii_lowercase()),
                SearchCriteria::WithLabel(label) => message.labels.contains(label),
                SearchCriteria::WithoutLabel(label) => !message.labels.contains(label),
            })
            .map(|(uid, _)| *uid)
            .collect();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: Uid, part: FetchPart) -> Result<Vec<u8>, MailboxError> {
        self.require_selected()
            .map_err(|message| MailboxError::Fetch { uid, message })?;
        let state = self.lock();
        if state.failures.contains(&FailOn::Fetch(uid)) {
            return Err(MailboxError::Fetch {
                uid,
                message: "fetch failed".into(),
            });
        }
        let message = state
            .messages
            .get(&uid)
            .filter(|message| !message.trashed())
            .ok_or(MailboxError::MissingPart { uid, part })?;

        Ok(match part {
            FetchPart::Header => header_section(&message.raw).to_vec(),
            FetchPart::Full => message.raw.clone(),
        })
    }

    async fn store_label(
        &mut self,
        uid: Uid,
        delta: LabelDelta,
        label: &str,
    ) -> Result<(), MailboxError> {
        let store_error = |message: &str| MailboxError::Store {
            uid,
            label: label.to_string(),
            message: message.to_string(),
        };
        self.require_selected().map_err(|m| store_error(&m))?;

        let mut guard = self.lock();
        let state = &mut *guard;
        state.store_calls += 1;
        if state
            .failures
            .iter()
            .any(|failure| matches!(failure, FailOn::StoreLabel(l) if l == label))
        {
            return Err(store_error("NO label change rejected"));
        }
        let message = state
            .messages
            .get_mut(&uid)
            .filter(|message| !message.trashed())
            .ok_or_else(|| store_error("NO no such message"))?;

        match delta {
            LabelDelta::Add => {
                message.labels.insert(label.to_string());
                if !label.starts_with('\\') {
                    state.known_labels.insert(label.to_string());
                }
            }
            LabelDelta::Remove => {
                message.labels.remove(label);
            }
        }
        Ok(())
    }

    async fn list_labels(&mut self, prefix: &str) -> Result<Vec<String>, MailboxError> {
        if !self.open {
            return Err(MailboxError::List("session closed".into()));
        }
        let state = self.lock();
        Ok(state
            .known_labels
            .iter()
            .filter(|label| label.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn expunge(&mut self) -> Result<(), MailboxError> {
        self.require_selected().map_err(MailboxError::Expunge)?;
        let mut state = self.lock();
        if state.failures.contains(&FailOn::Expunge) {
            return Err(MailboxError::Expunge("NO expunge refused".into()));
        }
        state.messages.retain(|_, message| !message.trashed());
        state.expunges += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        if !self.selected {
            return Err(MailboxError::Close("no folder selected".into()));
        }
        self.selected = false;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        if !self.open {
            return Err(MailboxError::Logout("already logged out".into()));
        }
        self.open = false;
        self.lock().sessions_closed += 1;
        Ok(())
    }
}

/// Bytes up to and including the blank line that ends the header block.
fn header_section(raw: &[u8]) -> &[u8] {
    let end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
        .or_else(|| {
            raw.windows(2)
                .position(|window| window == b"\n\n")
                .map(|index| index + 2)
        })
        .unwrap_or(raw.len());
    &raw[..end]
}

fn header_value(raw: &[u8], name: &str) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(header_section(raw)).ok()?;
    headers
        .iter()
        .find(|header| header.get_key_ref().eq_ignore_ascii_case(name))
        .map(|header| header.get_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\nSubject: hi\r\n\r\nbody";

    #[tokio::test]
    async fn trashed_messages_leave_the_folder_until_expunged() {
        let server = InMemoryMailServer::new();
        let keep = server.add_message(RAW);
        let trash = server.add_message(RAW);

        let mut session = server.connect().await.expect("connect");
        session.select(DEFAULT_FOLDER).await.expect("select");
        session
            .store_label(trash, LabelDelta::Add, TRASH_LABEL)
            .await
            .expect("trash");

        let all = session.search(&SearchCriteria::All).await.expect("search");
        assert_eq!(all, vec![keep]);
        assert!(session.fetch(trash, FetchPart::Header).await.is_err());

        session.expunge().await.expect("expunge");
        assert!(!server.contains(trash));
        assert_eq!(server.message_count(), 1);
    }

    #[tokio::test]
    async fn header_fetch_stops_at_blank_line() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(RAW);
        let mut session = server.connect().await.expect("connect");
        session.select(DEFAULT_FOLDER).await.expect("select");

        let header = session.fetch(uid, FetchPart::Header).await.expect("fetch");
        assert!(header.ends_with(b"\r\n\r\n"));
        assert!(!String::from_utf8_lossy(&header).contains("body"));
    }

    #[tokio::test]
    async fn connect_failures_are_consumed_then_sessions_open() {
        let server = InMemoryMailServer::new();
        server.fail_on(FailOn::Connect(1));

        assert!(matches!(
            server.connect().await,
            Err(ConnectError::Connection { .. })
        ));
        let mut session = server.connect().await.expect("second attempt");
        assert!(session.search(&SearchCriteria::All).await.is_err());
        session.select(DEFAULT_FOLDER).await.expect("select");
        session.close().await.expect("close");
        session.logout().await.expect("logout");
        assert_eq!(server.sessions_opened(), 1);
        assert_eq!(server.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn from_search_is_case_insensitive_substring() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(RAW);
        server.add_message(b"From: bob@example.com\r\n\r\nx".to_vec());
        let mut session = server.connect().await.expect("connect");
        session.select(DEFAULT_FOLDER).await.expect("select");

        let found = session
            .search(&SearchCriteria::From("ALICE@example.com".into()))
            .await
            .expect("search");
        assert_eq!(found, vec![uid]);
    }
}
