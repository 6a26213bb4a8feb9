use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{
    ConnectError, Connector, FetchPart, LabelDelta, Mailbox, MailboxError, SearchCriteria, Uid,
};
use crate::config::ImapConfig;

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to an IMAP server over implicit TLS with username/password login.
pub struct ImapConnector {
    config: ImapConfig,
    tls: TlsConnector,
}

enum AttemptError {
    Transient(String),
    Fatal(ConnectError),
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Result<Self, ConnectError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| ConnectError::Tls(err.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    async fn attempt(&self) -> Result<ImapSession, AttemptError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let tcp = match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(err)) => return Err(AttemptError::Transient(err.to_string())),
            Err(_) => return Err(AttemptError::Transient("tcp connect timed out".into())),
        };

        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|err| AttemptError::Fatal(ConnectError::Tls(err.to_string())))?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|err| AttemptError::Transient(format!("tls handshake: {err}")))?;

        let client = async_imap::Client::new(tls.compat());
        match client
            .login(&self.config.username, &self.config.password)
            .await
        {
            Ok(session) => Ok(session),
            Err((err, _client)) => match err {
                async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
                    Err(AttemptError::Fatal(ConnectError::Auth(err.to_string())))
                }
                other => Err(AttemptError::Transient(other.to_string())),
            },
        }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn Mailbox>, ConnectError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.attempt().await {
                Ok(session) => {
                    debug!(host = %self.config.host, attempt, "imap session established");
                    return Ok(Box::new(ImapMailbox { session }));
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(message)) => {
                    warn!(host = %self.config.host, attempt, error = %message, "imap connection attempt failed");
                    last_error = message;
                    if attempt < attempts {
                        sleep(backoff_with_jitter(self.config.retry_backoff(), attempt)).await;
                    }
                }
            }
        }

        Err(ConnectError::Connection {
            attempts,
            message: last_error,
        })
    }

    fn folder(&self) -> &str {
        &self.config.folder
    }
}

fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1).min(6));
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    base.saturating_mul(exp).mul_f64(factor)
}

pub struct ImapMailbox {
    session: ImapSession,
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn select(&mut self, folder: &str) -> Result<u32, MailboxError> {
        let mailbox = self
            .session
            .select(folder)
            .await
            .map_err(|err| MailboxError::Select {
                folder: folder.to_string(),
                message: err.to_string(),
            })?;
        info!(folder, exists = mailbox.exists, "selected folder");
        Ok(mailbox.exists)
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError> {
        let query = criteria.to_query();
        let found = self
            .session
            .uid_search(&query)
            .await
            .map_err(|err| MailboxError::Search(format!("{query}: {err}")))?;
        let mut uids: Vec<Uid> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: Uid, part: FetchPart) -> Result<Vec<u8>, MailboxError> {
        let fetches: Vec<_> = self
            .session
            .uid_fetch(uid.to_string(), part.as_query())
            .await
            .map_err(|err| MailboxError::Fetch {
                uid,
                message: err.to_string(),
            })?
            .try_collect()
            .await
            .map_err(|err| MailboxError::Fetch {
                uid,
                message: err.to_string(),
            })?;

        let bytes = fetches.iter().find_map(|fetch| match part {
            FetchPart::Header => fetch.header(),
            FetchPart::Full => fetch.body(),
        });
        bytes
            .map(<[u8]>::to_vec)
            .ok_or(MailboxError::MissingPart { uid, part })
    }

    async fn store_label(
        &mut self,
        uid: Uid,
        delta: LabelDelta,
        label: &str,
    ) -> Result<(), MailboxError> {
        let store_error = |message: String| MailboxError::Store {
            uid,
            label: label.to_string(),
            message,
        };
        let _updates: Vec<_> = self
            .session
            .uid_store(uid.to_string(), delta.store_query(label))
            .await
            .map_err(|err| store_error(err.to_string()))?
            .try_collect()
            .await
            .map_err(|err| store_error(err.to_string()))?;
        Ok(())
    }

    async fn list_labels(&mut self, prefix: &str) -> Result<Vec<String>, MailboxError> {
        let pattern = format!("{prefix}*");
        let names: Vec<_> = self
            .session
            .list(Some(""), Some(pattern.as_str()))
            .await
            .map_err(|err| MailboxError::List(err.to_string()))?
            .try_collect()
            .await
            .map_err(|err| MailboxError::List(err.to_string()))?;

        let mut labels: Vec<String> = names
            .iter()
            .map(|name| name.name().to_string())
            .filter(|name| name.starts_with(prefix))
            .collect();
        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    async fn expunge(&mut self) -> Result<(), MailboxError> {
        let removed: Vec<u32> = self
            .session
            .expunge()
            .await
            .map_err(|err| MailboxError::Expunge(err.to_string()))?
            .try_collect()
            .await
            .map_err(|err| MailboxError::Expunge(err.to_string()))?;
        debug!(removed = removed.len(), "expunged");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MailboxError> {
        self.session
            .close()
            .await
            .map_err(|err| MailboxError::Close(err.to_string()))
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.session
            .logout()
            .await
            .map_err(|err| MailboxError::Logout(err.to_string()))
    }
}
