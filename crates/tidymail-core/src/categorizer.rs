//! AI-assisted organizer.
//!
//! Walks the messages that do not yet carry the AI checked marker in server order,
//! summarizes each one, asks the classifier for a category and labels the message
//! with the answer. Messages that fail at any step get a diagnostics record.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::labels::{ApplyOutcome, OrganizerKind, UNSURE_CATEGORY, apply_with_marker};
use crate::llm::{Classification, ClassificationPrompt, LLMClient, LlmCallContext};
use crate::mailbox::{Connector, FetchPart, Mailbox, Uid, close_session};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::report::{OperationError, RunSummary};
use crate::stores::{DiagnosticLog, DiagnosticRecord};
use crate::summary::summarize_message;

const OPERATION: &str = "ai_organize";
const KIND: OrganizerKind = OrganizerKind::Ai;

/// How many unchecked messages one run may classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmailLimit {
    #[default]
    All,
    Count(usize),
}

impl EmailLimit {
    fn apply(self, uids: &mut Vec<Uid>) {
        if let EmailLimit::Count(n) = self {
            uids.truncate(n);
        }
    }
}

impl From<Option<usize>> for EmailLimit {
    fn from(value: Option<usize>) -> Self {
        value.map_or(EmailLimit::All, EmailLimit::Count)
    }
}

pub struct AiCategorizer {
    connector: Arc<dyn Connector>,
    llm: Arc<dyn LLMClient>,
    prompt: ClassificationPrompt,
    model: ModelConfig,
    diagnostics: DiagnosticLog,
    summary_budget: usize,
}

impl AiCategorizer {
    pub fn new(
        connector: Arc<dyn Connector>,
        llm: Arc<dyn LLMClient>,
        prompt: ClassificationPrompt,
        model: ModelConfig,
        diagnostics: DiagnosticLog,
        summary_budget: usize,
    ) -> Self {
        Self {
            connector,
            llm,
            prompt,
            model,
            diagnostics,
            summary_budget,
        }
    }

    /// Classify up to `limit` unchecked messages into `categories`.
    ///
    /// The session is expunged and closed on every exit path, including
    /// cancellation and fatal classifier errors.
    pub async fn organize(
        &self,
        categories: &[String],
        limit: EmailLimit,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        let mut session = self.connector.connect().await?;
        let result = self
            .run(session.as_mut(), categories, limit, cancel, progress)
            .await;

        if let Err(err) = session.expunge().await {
            warn!(error = %err, "expunge after ai organize failed");
        }
        close_session(session.as_mut()).await;
        result
    }

    async fn run(
        &self,
        session: &mut dyn Mailbox,
        categories: &[String],
        limit: EmailLimit,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, OperationError> {
        session.select(self.connector.folder()).await?;
        let mut uids = session.search(&KIND.unchecked()).await?;
        limit.apply(&mut uids);

        let mut summary = RunSummary::new(OPERATION, uids.len());
        let tracker = ProgressTracker::new(progress, uids.len());
        info!(
            messages = uids.len(),
            categories = categories.len(),
            "starting ai organize"
        );

        for (index, &uid) in uids.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(processed = summary.processed, "ai organize cancelled");
                return Ok(summary.cancelled());
            }

            self.process(session, uid, categories, &mut summary).await?;
            tracker.update(index + 1);
        }

        info!(
            processed = summary.processed,
            unsure = summary.unsure,
            skipped = summary.skipped,
            errors = summary.errors,
            "ai organize finished"
        );
        Ok(summary)
    }

    async fn process(
        &self,
        session: &mut dyn Mailbox,
        uid: Uid,
        categories: &[String],
        summary: &mut RunSummary,
    ) -> Result<(), OperationError> {
        let raw = match session.fetch(uid, FetchPart::Full).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(uid, error = %err, "fetch failed; skipping message");
                summary.skipped += 1;
                let mut record = DiagnosticRecord::new(KIND, "fetch_error");
                record.error = Some(err.to_string());
                self.write_diagnostics(uid, record).await;
                return Ok(());
            }
        };

        let email = match summarize_message(&raw, self.summary_budget) {
            Ok(email) => email,
            Err(err) => {
                warn!(uid, error = %err, "message could not be parsed; skipping");
                summary.skipped += 1;
                let mut record = DiagnosticRecord::new(KIND, "parse_error");
                record.error = Some(err.to_string());
                self.write_diagnostics(uid, record).await;
                return Ok(());
            }
        };

        let mut record = DiagnosticRecord::new(KIND, "label_error");
        record.sender = Some(email.from.clone());
        record.subject = Some(email.subject.clone());
        record.date = Some(email.date.clone());
        record.summary = Some(email.body.clone());

        let request = self.prompt.request(categories, &email.render(), &self.model);
        let answer = match self
            .llm
            .complete(request, LlmCallContext::for_message("classification", uid))
            .await
        {
            Ok(response) => response.content,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(uid, error = %err, "classifier call failed; leaving message unchecked");
                summary.errors += 1;
                record.outcome = "classifier_error".to_string();
                record.error = Some(err.to_string());
                self.write_diagnostics(uid, record).await;
                return Ok(());
            }
        };
        record.classifier_answer = Some(answer.clone());

        let (category, unsure) = match Classification::parse(&answer, categories) {
            Classification::Category(category) => (category, false),
            Classification::None => (UNSURE_CATEGORY.to_string(), true),
            Classification::Invalid(answer) => {
                warn!(uid, answer = %answer, "classifier answered outside the category set");
                summary.errors += 1;
                record.outcome = "invalid_answer".to_string();
                self.write_diagnostics(uid, record).await;
                return Ok(());
            }
        };

        let application =
            apply_with_marker(session, KIND, uid, &KIND.category_label(&category)).await;
        match application.outcome {
            ApplyOutcome::Applied if unsure => summary.unsure += 1,
            ApplyOutcome::Applied => summary.processed += 1,
            ApplyOutcome::DecisionFailed | ApplyOutcome::CheckedFailed => {
                summary.errors += 1;
                record.label_calls = application.steps;
                self.write_diagnostics(uid, record).await;
                return Ok(());
            }
        }
        debug!(uid, category = %category, "message classified");
        Ok(())
    }

    async fn write_diagnostics(&self, uid: Uid, record: DiagnosticRecord) {
        if let Err(err) = self.diagnostics.record(uid, record).await {
            warn!(uid, error = %err, "failed to write diagnostics record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LLMError, MockLLMClient};
    use crate::mailbox::{FailOn, InMemoryMailServer};
    use crate::progress::NoProgress;
    use crate::report::Outcome;
    use tempfile::TempDir;

    fn model() -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.0,
            max_output_tokens: 20,
            prompt_template: None,
        }
    }

    fn message(from: &str, subject: &str) -> String {
        format!("From: {from}\r\nSubject: {subject}\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\nHello there")
    }

    fn categorizer(
        server: &InMemoryMailServer,
        llm: &MockLLMClient,
        dir: &TempDir,
    ) -> AiCategorizer {
        AiCategorizer::new(
            Arc::new(server.clone()),
            Arc::new(llm.clone()),
            ClassificationPrompt::default(),
            model(),
            DiagnosticLog::new(dir.path().join("log.json")),
            2500,
        )
    }

    fn categories() -> Vec<String> {
        vec!["Finance".to_string(), "Travel".to_string()]
    }

    #[tokio::test]
    async fn limit_caps_the_number_of_classified_messages() {
        let server = InMemoryMailServer::new();
        for n in 0..4 {
            server.add_message(message("a@x.com", &format!("m{n}")));
        }
        let llm = MockLLMClient::with_answers(["Travel", "Travel"]);
        let dir = TempDir::new().expect("temp dir");

        let summary = categorizer(&server, &llm, &dir)
            .organize(&categories(), EmailLimit::Count(2), &CancellationToken::new(), &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.total, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(llm.call_count(), 2);
        assert_eq!(server.expunge_count(), 1);
        assert_eq!(server.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn fetch_failures_are_skipped_and_logged() {
        let server = InMemoryMailServer::new();
        let bad = server.add_message(message("a@x.com", "broken"));
        let good = server.add_message(message("b@x.com", "fine"));
        server.fail_on(FailOn::Fetch(bad));
        let llm = MockLLMClient::with_answers(["Finance"]);
        let dir = TempDir::new().expect("temp dir");
        let categorizer = categorizer(&server, &llm, &dir);

        let summary = categorizer
            .organize(&categories(), EmailLimit::All, &CancellationToken::new(), &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert!(!server.labels_of(bad).contains(&KIND.checked_label()));
        assert!(server.labels_of(good).contains(&KIND.category_label("Finance")));

        let log = categorizer.diagnostics.load().await.expect("log");
        assert_eq!(log[&bad.to_string()].outcome, "fetch_error");
        assert!(!log.contains_key(&good.to_string()));
    }

    #[tokio::test]
    async fn clean_run_writes_no_diagnostics() {
        let server = InMemoryMailServer::new();
        for n in 0..5 {
            server.add_message(message("a@x.com", &format!("trip {n}")));
        }
        let llm = MockLLMClient::with_answers(["Travel"; 5]);
        let dir = TempDir::new().expect("temp dir");
        let categorizer = categorizer(&server, &llm, &dir);

        let summary = categorizer
            .organize(&categories(), EmailLimit::All, &CancellationToken::new(), &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.errors, 0);
        assert!(!dir.path().join("log.json").exists());
        assert!(categorizer.diagnostics.load().await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn label_failure_records_the_attempted_calls() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(message("a@x.com", "statement"));
        server.fail_on(FailOn::StoreLabel(KIND.checked_label()));
        let llm = MockLLMClient::with_answers(["Finance"]);
        let dir = TempDir::new().expect("temp dir");
        let categorizer = categorizer(&server, &llm, &dir);

        let summary = categorizer
            .organize(&categories(), EmailLimit::All, &CancellationToken::new(), &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.errors, 1);
        let log = categorizer.diagnostics.load().await.expect("log");
        let record = &log[&uid.to_string()];
        assert_eq!(record.outcome, "label_error");
        assert_eq!(record.classifier_answer.as_deref(), Some("Finance"));
        assert_eq!(record.subject.as_deref(), Some("statement"));
        assert_eq!(record.label_calls.len(), 2);
        assert!(record.label_calls[0].ok);
        assert!(!record.label_calls[1].ok);
    }

    #[tokio::test]
    async fn fatal_classifier_errors_abort_but_close_the_session() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(message("a@x.com", "s"));
        let llm = MockLLMClient::new();
        llm.enqueue_response(Err(LLMError::AuthenticationFailed));
        let dir = TempDir::new().expect("temp dir");

        let err = categorizer(&server, &llm, &dir)
            .organize(&categories(), EmailLimit::All, &CancellationToken::new(), &NoProgress)
            .await
            .expect_err("fatal");

        assert!(matches!(err, OperationError::Classifier(LLMError::AuthenticationFailed)));
        assert!(server.labels_of(uid).is_empty());
        assert_eq!(server.sessions_closed(), 1);
        assert_eq!(RunSummary::from_result(OPERATION, Err(err)).outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn transient_classifier_errors_leave_message_unchecked() {
        let server = InMemoryMailServer::new();
        let uid = server.add_message(message("a@x.com", "s"));
        let llm = MockLLMClient::new();
        llm.enqueue_response(Err(LLMError::Timeout));
        let dir = TempDir::new().expect("temp dir");

        let summary = categorizer(&server, &llm, &dir)
            .organize(&categories(), EmailLimit::All, &CancellationToken::new(), &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.errors, 1);
        assert!(server.labels_of(uid).is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_start_processes_nothing() {
        let server = InMemoryMailServer::new();
        server.add_message(message("a@x.com", "s"));
        let llm = MockLLMClient::with_answers(["Finance"]);
        let dir = TempDir::new().expect("temp dir");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = categorizer(&server, &llm, &dir)
            .organize(&categories(), EmailLimit::All, &cancel, &NoProgress)
            .await
            .expect("organize");

        assert_eq!(summary.outcome, Outcome::Cancelled);
        assert_eq!(summary.processed, 0);
        assert_eq!(llm.call_count(), 0);
        assert_eq!(server.expunge_count(), 1);
        assert_eq!(server.sessions_closed(), 1);
    }

    #[test]
    fn limit_from_option() {
        assert_eq!(EmailLimit::from(None), EmailLimit::All);
        assert_eq!(EmailLimit::from(Some(3)), EmailLimit::Count(3));
    }
}
