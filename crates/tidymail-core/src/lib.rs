pub mod categorizer;
pub mod config;
pub mod labels;
pub mod llm;
pub mod mailbox;
pub mod organizer;
pub mod progress;
pub mod purge;
pub mod report;
pub mod reset;
pub mod rules;
pub mod scanner;
pub mod senders;
pub mod stores;
pub mod summary;
pub mod telemetry;

pub use categorizer::{AiCategorizer, EmailLimit};
pub use config::Config;
pub use labels::OrganizerKind;
pub use mailbox::{Connector, ImapConnector, Mailbox};
pub use organizer::RuleOrganizer;
pub use progress::{NoProgress, ProgressSample, ProgressSink};
pub use purge::SenderPurge;
pub use report::{OperationError, Outcome, RunSummary};
pub use reset::{LabelReset, LocalReset, LocalTarget};
pub use scanner::{ScanReport, SenderScanner};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
