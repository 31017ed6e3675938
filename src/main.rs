use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use luckymart_guard::config::Config;
use luckymart_guard::core::RewardType;
use luckymart_guard::db::SharedDatabase;
use luckymart_guard::jobs::Jobs;
use luckymart_guard::referral::{self, cycle::{self, CycleAlgorithm}};
use luckymart_guard::rewards::NewDelayedReward;

#[derive(Parser)]
#[command(name = "luckymart-guard")]
#[command(about = "Anti-fraud detectors and delayed reward scheduler for LuckyMart", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fraud detectors once
    Detect {
        /// Run only this detector (e.g. batchRegistration)
        #[arg(long)]
        only: Option<String>,
    },
    /// Credit due rewards, or list them with --pending
    Rewards {
        #[arg(long)]
        pending: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show reward queue statistics
    Stats,
    /// Show the most recent fraud log entries
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Remove expired blacklist entries and old finished rewards
    Cleanup {
        /// Keep finished rewards younger than this many days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Schedule a delayed reward for a user
    Grant {
        #[arg(long)]
        user: String,
        /// referral_register, referral_first_play or referral_first_purchase
        #[arg(long = "type")]
        reward_type: RewardType,
        /// Amount in diram
        #[arg(long, allow_negative_numbers = true)]
        amount: i64,
        /// Referee whose action earned the reward
        #[arg(long)]
        source_user: Option<String>,
        #[arg(long)]
        order: Option<String>,
        #[arg(long, default_value_t = 1)]
        level: u8,
    },
    /// Seed users, referrals, devices and transactions from CSV files
    Import {
        #[arg(long)]
        users: Option<PathBuf>,
        #[arg(long)]
        referrals: Option<PathBuf>,
        #[arg(long)]
        devices: Option<PathBuf>,
        #[arg(long)]
        transactions: Option<PathBuf>,
    },
    /// Look for a referral loop that leaves `start` and returns to it
    Cycle {
        #[arg(long)]
        start: String,
        /// Only report a loop that returns to `start` from this user
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Recursive)]
        algorithm: AlgorithmArg,
        /// Benchmark iterations when comparing both algorithms
        #[arg(long, default_value_t = 10)]
        iterations: usize,
    },
    /// Record a referral after checking it cannot close a loop
    Bind {
        #[arg(long)]
        referrer: String,
        #[arg(long)]
        referee: String,
    },
    /// Run detections, reward batches and cleanup on their intervals until Ctrl-C
    Run,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Recursive,
    Iterative,
    Both,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_database(config: &Config) -> Result<SharedDatabase, Box<dyn std::error::Error>> {
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SharedDatabase::open_with_timeout(
        db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?;
    tracing::info!("Database opened at {}", config.database.path);

    if let Some(ref csv_path_str) = config.database.blacklist_csv {
        let csv_path = Path::new(csv_path_str);
        if csv_path.exists() {
            match db.load_blacklist_from_csv(csv_path, Utc::now()) {
                Ok(count) => tracing::info!("Loaded {count} blacklist entries from CSV"),
                Err(e) => tracing::warn!("Failed to load blacklist CSV: {e}"),
            }
        }
    }
    Ok(db)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("luckymart_guard=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);
    tracing::debug!("Config: {:?}", config);

    let db = open_database(&config)?;
    let jobs = Jobs::new(db.clone(), &config);
    let now = Utc::now();

    match cli.command {
        Commands::Detect { only: Some(name) } => match jobs.monitor().run_detector(&name, now) {
            Some(results) => print_json(&results?)?,
            None => {
                let known = jobs.monitor().detector_names().join(", ");
                return Err(format!("unknown detector {name} (known: {known})").into());
            }
        },
        Commands::Detect { only: None } => print_json(&jobs.detection_pass(now))?,
        Commands::Rewards { pending: true, limit } => {
            print_json(&jobs.rewards().pending_rewards(now, limit)?)?
        }
        Commands::Rewards { pending: false, .. } => print_json(&jobs.reward_pass(now)?)?,
        Commands::Stats => print_json(&jobs.rewards().get_processing_stats(now)?)?,
        Commands::Logs { limit } => print_json(&db.recent_fraud_logs(limit)?)?,
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.rewards.cleanup_after_days);
            print_json(&jobs.cleanup_pass(days, now)?)?
        }
        Commands::Grant {
            user,
            reward_type,
            amount,
            source_user,
            order,
            level,
        } => {
            let reward = match (reward_type, source_user, order) {
                (RewardType::ReferralFirstPurchase, Some(referee), Some(order)) => jobs
                    .rewards()
                    .create_first_purchase_reward(&user, &referee, &order, amount, level, now)?,
                (reward_type, source_user, order) => {
                    let mut request = NewDelayedReward::new(user, reward_type, amount);
                    request.source_user_id = source_user;
                    request.source_order_id = order;
                    request.referral_level = Some(level);
                    jobs.rewards().create_delayed_reward(request, now)?
                }
            };
            print_json(&reward)?
        }
        Commands::Import {
            users,
            referrals,
            devices,
            transactions,
        } => {
            // Users first so the other tables can point at them.
            let mut loaded = serde_json::Map::new();
            if let Some(path) = users {
                loaded.insert("users".into(), db.load_users_from_csv(&path, now)?.into());
            }
            if let Some(path) = referrals {
                loaded.insert("referrals".into(), db.load_referrals_from_csv(&path, now)?.into());
            }
            if let Some(path) = devices {
                loaded.insert("devices".into(), db.load_devices_from_csv(&path, now)?.into());
            }
            if let Some(path) = transactions {
                loaded.insert("transactions".into(), db.load_transactions_from_csv(&path, now)?.into());
            }
            tracing::info!(?loaded, "Import finished");
            print_json(&loaded)?
        }
        Commands::Cycle {
            start,
            target,
            max_depth,
            algorithm,
            iterations,
        } => {
            let max_depth = max_depth.unwrap_or(config.referral.max_depth);
            match algorithm {
                AlgorithmArg::Recursive => print_json(&cycle::detect_cycle(
                    &db,
                    &start,
                    target.as_deref(),
                    max_depth,
                    CycleAlgorithm::Recursive,
                )?)?,
                AlgorithmArg::Iterative => print_json(&cycle::detect_cycle(
                    &db,
                    &start,
                    target.as_deref(),
                    max_depth,
                    CycleAlgorithm::Iterative,
                )?)?,
                AlgorithmArg::Both => print_json(&cycle::benchmark_cycle_detection(
                    &db,
                    &start,
                    target.as_deref(),
                    max_depth,
                    iterations,
                )?)?,
            }
        }
        Commands::Bind { referrer, referee } => {
            referral::bind_referral(&db, &referrer, &referee, config.referral.max_depth, now)?;
            println!("bound {referrer} -> {referee}");
        }
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(jobs.run());
        }
    }

    Ok(())
}
