mod console;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use polibot_dataset::JsonFileDatasetLoader;
use polibot_scheduler::{NotificationService, SchedulerCore};
use polibot_store::{RuleStore, SqliteRuleStore};
use polibot_types::{RuleSpec, ScheduleKind};

use crate::console::ConsoleChannel;

#[derive(Parser)]
#[command(name = "polibot", about = "Policy expiry notification scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon (re-arms every user's rules, then waits)
    Run,
    /// Manage notification rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Evaluate and dispatch immediately for one target
    SendNow {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        target: String,
    },
    /// Show the dispatch audit log for a user
    History {
        #[arg(short, long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Create a rule
    Add {
        #[arg(short, long)]
        user: String,
        /// Destination group/channel identifier
        #[arg(short, long)]
        target: String,
        /// Dataset reference (JSON file name under the datasets directory,
        /// without extension)
        #[arg(short, long)]
        dataset: String,
        /// Schedule: "daily" (with --time), "hourly" (with --hours) or
        /// "minute" (with --minutes)
        #[arg(short, long)]
        schedule: String,
        /// Time of day for daily schedules ("HH:MM")
        #[arg(long)]
        time: Option<String>,
        /// Interval for hourly schedules
        #[arg(long)]
        hours: Option<u32>,
        /// Interval for minute schedules (defaults to 5)
        #[arg(long)]
        minutes: Option<u32>,
    },
    /// Update an existing rule's target, dataset or schedule
    Update {
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        target: String,
        #[arg(short, long)]
        dataset: String,
        #[arg(short, long)]
        schedule: String,
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        minutes: Option<u32>,
    },
    /// List a user's active rules
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Deactivate a rule
    Remove {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        id: String,
    },
}

fn parse_schedule(
    schedule: &str,
    time: Option<String>,
    hours: Option<u32>,
    minutes: Option<u32>,
) -> anyhow::Result<ScheduleKind> {
    match schedule {
        "daily" => Ok(ScheduleKind::Daily {
            time_of_day: time.ok_or_else(|| anyhow::anyhow!("daily schedule needs --time HH:MM"))?,
        }),
        "hourly" => Ok(ScheduleKind::Hourly {
            interval_hours: hours
                .ok_or_else(|| anyhow::anyhow!("hourly schedule needs --hours N"))?,
        }),
        "minute" => Ok(ScheduleKind::Minute {
            interval_minutes: minutes,
        }),
        other => anyhow::bail!("unknown schedule kind {other:?} (daily, hourly or minute)"),
    }
}

struct App {
    store: Arc<SqliteRuleStore>,
    core: Arc<SchedulerCore>,
}

fn build_app() -> anyhow::Result<App> {
    let config = polibot_config::load_config()?;
    polibot_config::ensure_config_dir()?;

    let store = Arc::new(SqliteRuleStore::open(&config.database_path()?)?);
    let loader = Arc::new(JsonFileDatasetLoader::new(config.datasets_dir()?));
    let channel = Arc::new(ConsoleChannel);
    let core = SchedulerCore::new(store.clone(), loader, channel);
    Ok(App { store, core })
}

async fn run_daemon(app: &App) -> anyhow::Result<()> {
    for user_id in app.store.active_user_ids().await? {
        // One user's re-arm failure must not keep the daemon from serving
        // the others.
        if let Err(e) = app.core.rearm_all(&user_id).await {
            tracing::warn!(user = %user_id, "Failed to re-arm rules: {e}");
        }
    }
    tracing::info!(
        armed = app.core.armed_rules().len(),
        "Scheduler running, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    app.core.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let app = build_app()?;
        match cli.command {
            Commands::Run => run_daemon(&app).await?,
            Commands::Rule { command } => match command {
                RuleCommands::Add {
                    user,
                    target,
                    dataset,
                    schedule,
                    time,
                    hours,
                    minutes,
                } => {
                    let schedule = parse_schedule(&schedule, time, hours, minutes)?;
                    let id = app
                        .core
                        .create_rule(RuleSpec {
                            user_id: user,
                            target_id: target,
                            dataset_ref: dataset,
                            schedule,
                        })
                        .await?;
                    println!("created rule {id}");
                }
                RuleCommands::Update {
                    id,
                    user,
                    target,
                    dataset,
                    schedule,
                    time,
                    hours,
                    minutes,
                } => {
                    let schedule = parse_schedule(&schedule, time, hours, minutes)?;
                    app.core
                        .update_rule(
                            &id,
                            RuleSpec {
                                user_id: user,
                                target_id: target,
                                dataset_ref: dataset,
                                schedule,
                            },
                        )
                        .await?;
                    println!("rule {id} updated");
                }
                RuleCommands::List { user } => {
                    for rule in app.core.list_rules(&user).await? {
                        let next = rule
                            .next_fire_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".into());
                        println!(
                            "{}  target={}  dataset={}  schedule={:?}  next={}",
                            rule.id, rule.target_id, rule.dataset_ref, rule.schedule, next
                        );
                    }
                }
                RuleCommands::Remove { user, id } => {
                    if app.core.deactivate_rule(&id, &user).await? {
                        println!("rule {id} deactivated");
                    } else {
                        println!("no active rule {id} for user {user}");
                    }
                }
            },
            Commands::SendNow { user, target } => {
                let service = NotificationService::new(app.core.clone());
                let count = service.send_now(&user, &target).await?;
                println!("dispatched {count} matching policies");
            }
            Commands::History { user } => {
                for record in app.store.dispatch_history(&user).await? {
                    println!(
                        "{}  target={}\n{}\n",
                        record.sent_at.to_rfc3339(),
                        record.target_id,
                        record.body
                    );
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule_daily() {
        let kind = parse_schedule("daily", Some("09:00".into()), None, None).unwrap();
        assert_eq!(
            kind,
            ScheduleKind::Daily {
                time_of_day: "09:00".into()
            }
        );
        assert!(parse_schedule("daily", None, None, None).is_err());
    }

    #[test]
    fn test_parse_schedule_intervals() {
        assert_eq!(
            parse_schedule("hourly", None, Some(2), None).unwrap(),
            ScheduleKind::Hourly { interval_hours: 2 }
        );
        assert_eq!(
            parse_schedule("minute", None, None, None).unwrap(),
            ScheduleKind::Minute {
                interval_minutes: None
            }
        );
        assert!(parse_schedule("weekly", None, None, None).is_err());
    }
}
