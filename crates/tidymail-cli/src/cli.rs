use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tidymail_core::OrganizerKind;
use tidymail_core::reset::LocalTarget;
use tidymail_core::senders::{SortKey, SortOrder};

#[derive(Parser, Debug)]
#[command(name = "tidymail")]
#[command(version)]
#[command(about = "Organize a Gmail mailbox by sender rules or an AI classifier", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.toml")]
    pub config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebuild the sender directory from every message in the mailbox
    Scan,

    /// List senders from the last scan
    Senders {
        /// Only senders whose address or name contains this text
        #[arg(long)]
        search: Option<String>,

        /// Only senders assigned to this label
        #[arg(long)]
        label: Option<String>,

        #[arg(long, value_enum, default_value_t = SortArg::Frequency)]
        sort: SortArg,

        /// Largest first
        #[arg(long)]
        desc: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Label or trash unprocessed mail using the sender rules
    Organize,

    /// Classify unprocessed mail into the configured categories
    AiOrganize {
        /// Maximum number of messages to classify
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Move every message from a sender to the trash
    Purge { address: String },

    /// Remove the labels an organizer applied (standard or ai)
    Reset { kind: OrganizerKind },

    /// Clear a local store (sender-labels, unsubscribed, categories, senders, all)
    ResetLocal { target: LocalTarget },

    /// Edit sender rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Edit AI categories
    Categories {
        #[command(subcommand)]
        action: CategoriesAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    List,
    /// File mail from an address under a label
    Label { address: String, label: String },
    /// Trash mail from an address on every organize run
    Unsubscribe { address: String },
    Resubscribe { address: String },
}

#[derive(Subcommand, Debug)]
pub enum CategoriesAction {
    List,
    Add { name: String },
    Remove { name: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortArg {
    Address,
    Name,
    Frequency,
}

impl SortArg {
    pub fn key(self) -> SortKey {
        match self {
            SortArg::Address => SortKey::Address,
            SortArg::Name => SortKey::Name,
            SortArg::Frequency => SortKey::Frequency,
        }
    }
}

pub fn sort_order(desc: bool) -> SortOrder {
    if desc {
        SortOrder::Descending
    } else {
        SortOrder::Ascending
    }
}
