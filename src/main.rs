//! # Pigeon — scheduled notifications and delivery queue
//!
//! Usage:
//!   pigeon init                                   # Write default config
//!   pigeon run                                    # Start the polling worker
//!   pigeon run --once                             # One delivery cycle, then exit
//!   pigeon schedule once --channel email --to a@b.com --content "Hi" \
//!          --at "2025-03-10 14:00" --tz America/Santo_Domingo
//!   pigeon schedule cron --channel push --to <token> --content "Standup" \
//!          --expr "0 9 * * MON" --tz America/Santo_Domingo
//!   pigeon cancel <schedule-id> --reason "no longer needed"
//!   pigeon enqueue --channel sms --to +18095550100 --content "Code 4242"
//!   pigeon next-cron "0 9 * * MON" --tz Europe/Madrid --count 3

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use pigeon_channels::ProviderRegistry;
use pigeon_core::config::PigeonConfig;
use pigeon_core::traits::SystemClock;
use pigeon_core::types::{ChannelType, NotificationPayload, RecurrencePattern};
use pigeon_scheduler::{
    CancelOutcome, CronSchedule, Dispatcher, PollingWorker, Scheduler, SqliteStore, timezone,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pigeon",
    version,
    about = "🕊️ Pigeon — scheduled notifications with a retrying delivery queue"
)]
struct Cli {
    /// Config file (default: ~/.pigeon/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init,
    /// Run the delivery worker
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Create a scheduled notification
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Cancel a schedule
    Cancel {
        id: String,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Move a schedule to a new local time (in its own zone)
    Reschedule {
        id: String,
        /// Local time, e.g. "2025-03-10 14:00"
        #[arg(long)]
        at: String,
    },
    /// Queue a notification for immediate delivery
    Enqueue(MessageArgs),
    /// Preview upcoming cron occurrences
    NextCron {
        expr: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long, default_value = "5")]
        count: usize,
    },
    /// Show queue and schedule state
    Status,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Fire once at a local time
    Once {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long)]
        at: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
    },
    /// Repeat daily, weekly, monthly, or yearly from a local start time
    Recurring {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long)]
        at: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        /// daily | weekly | monthly | yearly
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        max: Option<u32>,
    },
    /// Repeat on a cron expression
    Cron {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long)]
        expr: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long)]
        max: Option<u32>,
    },
}

#[derive(Args)]
struct MessageArgs {
    /// email | sms | push
    #[arg(long)]
    channel: String,
    #[arg(long)]
    to: String,
    #[arg(long, default_value = "")]
    subject: String,
    #[arg(long)]
    content: String,
    /// Extra metadata as key=value (repeatable)
    #[arg(long = "meta")]
    meta: Vec<String>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long, default_value = "cli")]
    by: String,
}

impl MessageArgs {
    fn payload(&self, config: &PigeonConfig) -> Result<NotificationPayload> {
        let channel = ChannelType::parse(&self.channel);
        if channel == ChannelType::Unknown {
            bail!("Unknown channel '{}' (expected email, sms, or push)", self.channel);
        }
        let mut payload = NotificationPayload::new(channel, &self.to, &self.subject, &self.content)
            .with_max_retries(
                self.max_retries
                    .unwrap_or(config.scheduler.default_max_retries),
            );
        for pair in &self.meta {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("Metadata must be key=value, got '{pair}'");
            };
            payload = payload.with_metadata(key.trim(), value.trim());
        }
        Ok(payload)
    }
}

fn parse_local(raw: &str) -> Result<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw.trim(), f).ok())
        .ok_or_else(|| anyhow::anyhow!("Cannot parse local time '{raw}' (use YYYY-MM-DD HH:MM)"))
}

fn open_store(config: &PigeonConfig) -> Result<Arc<SqliteStore>> {
    let path = config.storage.resolved_db_path();
    tracing::debug!("Opening database at {}", path.display());
    Ok(Arc::new(SqliteStore::open(&path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "pigeon=debug,pigeon_scheduler=debug,pigeon_channels=debug"
    } else {
        "pigeon=info,pigeon_scheduler=info,pigeon_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()));
    let initializing = matches!(cli.command, Command::Init);
    let config = match &config_path {
        Some(path) if initializing && !path.exists() => PigeonConfig::default(),
        Some(path) => PigeonConfig::load_from(path)?,
        None => PigeonConfig::load()?,
    };

    match cli.command {
        Command::Init => {
            let path = config_path.unwrap_or_else(PigeonConfig::default_path);
            config.save_to(&path)?;
            println!("✅ Config written to {}", path.display());
        }

        Command::Run { once } => {
            let store = open_store(&config)?;
            let providers = ProviderRegistry::from_config(&config)?;
            let backoff = chrono::Duration::seconds(
                config.worker.retry_backoff_secs.min(86_400 * 365) as i64,
            );
            let worker = PollingWorker::new(
                move || {
                    Ok(Dispatcher::from_store(
                        store.clone(),
                        providers.clone(),
                        Arc::new(SystemClock),
                    )
                    .with_retry_backoff(backoff))
                },
                Duration::from_secs(config.worker.poll_interval_secs.max(1)),
            )
            .with_requeue(config.worker.requeue_failed);

            if once {
                let stats = worker.run_cycle().await?;
                println!("📬 {stats}");
                return Ok(());
            }

            let handle = worker.spawn();
            tokio::signal::ctrl_c().await?;
            tracing::info!("Ctrl-C received, finishing current cycle...");
            handle.shutdown().await?;
        }

        Command::Schedule(cmd) => {
            let store = open_store(&config)?;
            let scheduler = Scheduler::from_config(store, Arc::new(SystemClock), &config.scheduler);
            let schedule = match cmd {
                ScheduleCommand::Once { message, at, tz } => {
                    scheduler
                        .schedule_one_time(message.payload(&config)?, parse_local(&at)?, &tz, &message.by)
                        .await?
                }
                ScheduleCommand::Recurring {
                    message,
                    at,
                    tz,
                    pattern,
                    max,
                } => {
                    let Some(pattern) = RecurrencePattern::parse(&pattern) else {
                        bail!("Unknown pattern '{pattern}' (daily, weekly, monthly, yearly)");
                    };
                    scheduler
                        .schedule_recurring(
                            message.payload(&config)?,
                            parse_local(&at)?,
                            pattern,
                            &tz,
                            max,
                            &message.by,
                        )
                        .await?
                }
                ScheduleCommand::Cron {
                    message,
                    expr,
                    tz,
                    max,
                } => {
                    scheduler
                        .schedule_with_cron(message.payload(&config)?, &expr, &tz, max, &message.by)
                        .await?
                }
            };
            println!("📅 Scheduled {}", schedule.id);
            match schedule.next_execution {
                Some(next) => println!(
                    "   Next: {} UTC ({} {})",
                    next,
                    timezone::convert_from_utc(next, &schedule.time_zone),
                    schedule.time_zone
                ),
                None => println!("   ⚠️  No upcoming execution"),
            }
        }

        Command::Cancel { id, reason, by } => {
            let store = open_store(&config)?;
            let scheduler = Scheduler::from_config(store, Arc::new(SystemClock), &config.scheduler);
            match scheduler.cancel(&id, &reason, &by).await? {
                CancelOutcome::Cancelled => println!("🚫 Cancelled {id}"),
                CancelOutcome::NotFound => bail!("Schedule {id} not found"),
                CancelOutcome::AlreadyTerminal(status) => {
                    println!("ℹ️  Schedule {id} is already {}", status.as_str())
                }
            }
        }

        Command::Reschedule { id, at } => {
            let store = open_store(&config)?;
            let scheduler = Scheduler::from_config(store, Arc::new(SystemClock), &config.scheduler);
            match scheduler.reschedule(&id, parse_local(&at)?).await? {
                Some(s) if s.is_active() => println!("🔁 {} now at {} UTC", s.id, s.scheduled_for),
                Some(s) => println!("ℹ️  Schedule {} is {}, unchanged", s.id, s.status.as_str()),
                None => bail!("Schedule {id} not found"),
            }
        }

        Command::Enqueue(message) => {
            let store = open_store(&config)?;
            let dispatcher = Dispatcher::from_store(
                store,
                ProviderRegistry::new(),
                Arc::new(SystemClock),
            );
            let payload = message.payload(&config)?;
            let item = dispatcher.enqueue(payload.instantiate(chrono::Utc::now())).await?;
            println!("📥 Queued {} (notification {})", item.id, item.notification_id);
        }

        Command::NextCron { expr, tz, count } => {
            let schedule = CronSchedule::parse(&expr)?;
            let zone = timezone::resolve_zone(&tz)?;
            let mut after = chrono::Utc::now();
            println!("⏰ {} ({tz})", schedule.expression());
            for _ in 0..count {
                let Some(next) = schedule.next_after(after, zone) else {
                    println!("   (no further occurrences)");
                    break;
                };
                println!("   {} → {} UTC", timezone::convert_from_utc(next, &tz), next);
                after = next;
            }
        }

        Command::Status => {
            let store = open_store(&config)?;
            println!("📬 Queue");
            let counts = store.queue_counts()?;
            if counts.is_empty() {
                println!("   (empty)");
            }
            for (status, count) in counts {
                println!("   {status:<12} {count}");
            }
            println!("📅 Active schedules");
            for s in store.active_schedules()? {
                let next = s
                    .next_execution
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "   {}  {:<7} {:<24} next {}",
                    s.id,
                    s.payload.channel,
                    s.payload.recipient,
                    next
                );
            }
        }
    }

    Ok(())
}
