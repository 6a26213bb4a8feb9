mod cli;
mod progress;

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tidymail_core::llm::{ClassificationPrompt, GenaiLLMClient};
use tidymail_core::senders::{Sender, sort_senders};
use tidymail_core::stores::{CategoryStore, DiagnosticLog, RuleStore, SenderDirectoryStore};
use tidymail_core::{
    AiCategorizer, Config, Connector, ImapConnector, LabelReset, LocalReset, Outcome,
    RuleOrganizer, RunSummary, ScanReport, SenderPurge, SenderScanner, init_telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{CategoriesAction, Cli, Command, RulesAction, sort_order};
use crate::progress::BarProgress;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let outcome = run(cli, &config, &cancel).await?;
    Ok(match outcome {
        Outcome::Error => ExitCode::FAILURE,
        Outcome::Success | Outcome::Cancelled => ExitCode::SUCCESS,
    })
}

async fn run(cli: Cli, config: &Config, cancel: &CancellationToken) -> CliResult<Outcome> {
    let json = cli.json;
    let paths = &config.paths;
    let senders = SenderDirectoryStore::new(&paths.senders);
    let rules = RuleStore::new(&paths.sender_labels, &paths.unsubscribed);
    let categories = CategoryStore::new(&paths.categories);

    match cli.command {
        Command::Scan => {
            let progress = BarProgress::new("scanning senders", !json);
            let report = SenderScanner::new(connector(config)?, senders, config.scan)
                .scan(cancel, &progress)
                .await;
            progress.finish();
            let report = report?;
            print_scan(&report, json);
            Ok(report.outcome)
        }
        Command::Senders {
            search,
            label,
            sort,
            desc,
            limit,
        } => {
            let directory = senders.load().await?;
            let mut listed = match &label {
                Some(label) => {
                    let addresses = rules.addresses_for_label(label).await?;
                    directory.restricted_to(addresses.iter().map(String::as_str))
                }
                None => directory.iter().collect(),
            };
            if let Some(query) = &search {
                listed.retain(|sender| sender.matches(query));
            }
            sort_senders(&mut listed, sort.key(), sort_order(desc));
            if let Some(limit) = limit {
                listed.truncate(limit);
            }
            print_senders(&listed, json);
            Ok(Outcome::Success)
        }
        Command::Organize => {
            let progress = BarProgress::new("organizing", !json);
            let result = RuleOrganizer::new(
                connector(config)?,
                rules,
                DiagnosticLog::new(&paths.diagnostics),
            )
            .organize(cancel, &progress)
            .await;
            progress.finish();
            Ok(print_summary(RunSummary::from_result("organize", result), json))
        }
        Command::AiOrganize { limit } => {
            let names = categories.load().await?;
            if names.is_empty() {
                return Err("no categories configured; add one with `tidymail categories add`".into());
            }
            let prompt = ClassificationPrompt::from_config(&config.model).await?;
            let llm = Arc::new(GenaiLLMClient::new(&config.model));
            info!(model = %llm.model(), categories = names.len(), "classifier ready");

            let progress = BarProgress::new("classifying", !json);
            let result = AiCategorizer::new(
                connector(config)?,
                llm,
                prompt,
                config.model.clone(),
                DiagnosticLog::new(&paths.diagnostics),
                config.organizer.summary_char_budget,
            )
            .organize(&names, limit.into(), cancel, &progress)
            .await;
            progress.finish();
            Ok(print_summary(RunSummary::from_result("ai_organize", result), json))
        }
        Command::Purge { address } => {
            let progress = BarProgress::new("purging", !json);
            let result = SenderPurge::new(connector(config)?, senders)
                .purge(&address, &progress)
                .await;
            progress.finish();
            Ok(print_summary(RunSummary::from_result("purge", result), json))
        }
        Command::Reset { kind } => {
            let progress = BarProgress::new("resetting labels", !json);
            let result = LabelReset::new(connector(config)?)
                .reset(kind, &progress)
                .await;
            progress.finish();
            Ok(print_summary(RunSummary::from_result("reset", result), json))
        }
        Command::ResetLocal { target } => {
            LocalReset {
                rules,
                categories,
                senders,
            }
            .reset(target)
            .await?;
            print_message(&format!("cleared {target}"), json);
            Ok(Outcome::Success)
        }
        Command::Rules { action } => {
            match action {
                RulesAction::List => {
                    let labels = rules.load_labels().await?;
                    let unsubscribed = rules.load_unsubscribed().await?;
                    if json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&json!({
                                "labels": labels,
                                "unsubscribed": unsubscribed,
                            }))?
                        );
                    } else {
                        for (label, addresses) in labels.iter().filter(|(_, a)| !a.is_empty()) {
                            println!("{label}: {}", addresses.join(", "));
                        }
                        for (address, _) in unsubscribed.iter().filter(|(_, active)| **active) {
                            println!("unsubscribed: {address}");
                        }
                    }
                }
                RulesAction::Label { address, label } => {
                    rules.assign_label(&address, &label).await?;
                    print_message(&format!("{address} -> {label}"), json);
                }
                RulesAction::Unsubscribe { address } => {
                    rules.unsubscribe(&address).await?;
                    print_message(&format!("unsubscribed {address}"), json);
                }
                RulesAction::Resubscribe { address } => {
                    let message = if rules.resubscribe(&address).await? {
                        format!("resubscribed {address}")
                    } else {
                        format!("{address} was not unsubscribed")
                    };
                    print_message(&message, json);
                }
            }
            Ok(Outcome::Success)
        }
        Command::Categories { action } => {
            match action {
                CategoriesAction::List => {
                    let names = categories.load().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&names)?);
                    } else {
                        names.iter().for_each(|name| println!("{name}"));
                    }
                }
                CategoriesAction::Add { name } => {
                    categories.add(&name).await?;
                    print_message(&format!("added {name}"), json);
                }
                CategoriesAction::Remove { name } => {
                    let message = if categories.remove(&name).await? {
                        format!("removed {name}")
                    } else {
                        format!("no category named {name}")
                    };
                    print_message(&message, json);
                }
            }
            Ok(Outcome::Success)
        }
    }
}

fn connector(config: &Config) -> CliResult<Arc<dyn Connector>> {
    Ok(Arc::new(ImapConnector::new(config.imap.clone())?))
}

fn print_summary(summary: RunSummary, json: bool) -> Outcome {
    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(body) => println!("{body}"),
            Err(err) => warn!(error = %err, "failed to serialize summary"),
        }
    } else {
        println!("{summary}");
    }
    summary.outcome
}

fn print_scan(report: &ScanReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(body) => println!("{body}"),
            Err(err) => warn!(error = %err, "failed to serialize scan report"),
        }
        return;
    }
    match report.outcome {
        Outcome::Cancelled => println!(
            "scan cancelled after {} of {} batches; sender list unchanged",
            report.batches_completed, report.batches
        ),
        _ => println!(
            "{} senders found in {} messages, {} skipped",
            report.senders, report.messages, report.skipped
        ),
    }
}

fn print_senders(senders: &[Sender], json: bool) {
    if json {
        match serde_json::to_string_pretty(senders) {
            Ok(body) => println!("{body}"),
            Err(err) => warn!(error = %err, "failed to serialize senders"),
        }
        return;
    }
    for sender in senders {
        if sender.name.is_empty() {
            println!("{:>6}  {}", sender.frequency, sender.address);
        } else {
            println!("{:>6}  {} <{}>", sender.frequency, sender.name, sender.address);
        }
    }
}

fn print_message(message: &str, json: bool) {
    if json {
        println!("{}", json!({ "message": message }));
    } else {
        println!("{message}");
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("received ctrl+c, finishing current item");
            cancel.cancel();
        }
        Err(err) => warn!(error = %err, "failed to install Ctrl+C handler"),
    }
}
