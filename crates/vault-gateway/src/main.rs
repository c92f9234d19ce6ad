//! Vault gateway: runs the lifecycle engine against Discord and exposes a few
//! operator commands over the same database.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Duration;
use clap::{Parser, Subcommand};
use tracing::info;
use vault_core::config::VaultConfig;
use vault_core::{
    amount, ChannelId, Clock, ContextId, PrivilegeId, Reward, SubjectId, SystemClock,
};
use vault_discord::DiscordPlatform;
use vault_ledger::Ledger;
use vault_lifecycle::types::NewContest;
use vault_lifecycle::{GrantOutcome, HeistSettings, LifecycleEngine, LifecycleStore};

#[derive(Parser)]
#[command(name = "vault-gateway")]
#[command(about = "Timed privileges, contests and the daily heist", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VAULT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until Ctrl-C (default)
    Run,
    /// Resolve overdue work once and exit
    Reconcile,
    /// Show a subject's balance and draw count
    Balance { subject: String },
    /// Grant a privilege that expires after `secs`
    Grant {
        subject: String,
        context: String,
        privilege: String,
        #[arg(long)]
        secs: i64,
    },
    #[command(subcommand)]
    Contest(ContestCommand),
    #[command(subcommand)]
    Heist(HeistCommand),
}

#[derive(Subcommand)]
enum ContestCommand {
    /// Announce a contest; pass exactly one reward flag
    Start {
        context: String,
        channel: String,
        title: String,
        /// Seconds until the draw
        #[arg(long)]
        ends_in: i64,
        #[arg(long, default_value_t = 1)]
        winners: u32,
        #[arg(long)]
        balance: Option<String>,
        #[arg(long)]
        draws: Option<i64>,
        #[arg(long)]
        privilege: Option<String>,
        /// Makes `--privilege` expire after this many seconds
        #[arg(long, requires = "privilege")]
        privilege_secs: Option<i64>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Draw a fresh set of winners for an ended contest
    Reroll { id: String },
    Cancel { id: String },
}

#[derive(Subcommand)]
enum HeistCommand {
    /// Create today's heist in a channel
    Start {
        context: String,
        channel: String,
        #[arg(long, default_value = "")]
        payload: String,
    },
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vault_gateway=info,vault_lifecycle=info,vault_ledger=info,vault_discord=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit path > VAULT_CONFIG env > ~/.vault/vault.toml
    let config = VaultConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        VaultConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // ledger and lifecycle tables share one file, each through its own connection
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = LifecycleStore::new(open_db(db_path)?)?;
    let ledger = Ledger::new(
        open_db(db_path)?,
        config.ledger.starting_balance()?,
        clock.clone(),
    )?;

    let Some(discord) = config.discord.as_ref() else {
        bail!("no [discord] section configured; a bot token is required");
    };
    let platform = Arc::new(DiscordPlatform::new(discord)?);
    let heist = HeistSettings::from_config(&config.heist)?;

    let (engine, runner) = LifecycleEngine::new(
        store,
        ledger,
        platform,
        clock.clone(),
        config.scheduler.clone(),
        heist,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = tokio::spawn(runner.run(shutdown_rx));
            info!("Vault gateway running; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
        Command::Reconcile => {
            let report = engine.reconcile().await;
            println!(
                "resolved {} effects, {} privileges, {} contests, {} awards; {} timers armed",
                report.effects.resolved,
                report.privileges.resolved,
                report.contests.resolved,
                report.awards.resolved,
                report.armed
            );
        }
        Command::Balance { subject } => {
            let account = engine.ledger().account(&SubjectId::from(subject))?;
            println!("{}: balance {}, draws {}", account.subject, account.balance, account.draws);
        }
        Command::Grant {
            subject,
            context,
            privilege,
            secs,
        } => {
            if secs <= 0 {
                bail!("--secs must be positive");
            }
            let outcome = engine
                .privileges()
                .grant(
                    &SubjectId::from(subject),
                    &ContextId::from(context),
                    &PrivilegeId::from(privilege),
                    Duration::seconds(secs),
                )
                .await?;
            match outcome {
                GrantOutcome::Granted(row) => println!("granted until {}", row.expires_at),
                GrantOutcome::Unreachable => println!("subject not found; nothing granted"),
            }
        }
        Command::Contest(ContestCommand::Start {
            context,
            channel,
            title,
            ends_in,
            winners,
            balance,
            draws,
            privilege,
            privilege_secs,
            host,
        }) => {
            let reward = contest_reward(balance, draws, privilege, privilege_secs)?;
            let contest = engine
                .contests()
                .create(NewContest {
                    context: ContextId::from(context),
                    channel: ChannelId::from(channel),
                    title,
                    reward,
                    ends_at: clock.now() + Duration::seconds(ends_in),
                    winner_count: winners,
                    host: host.map(SubjectId::from),
                })
                .await?;
            println!("contest {} ends at {}", contest.id, contest.ends_at);
        }
        Command::Contest(ContestCommand::Reroll { id }) => {
            let result = engine.contests().reroll(&id).await?;
            println!(
                "draw #{}: {} winner(s)",
                result.draw.draw_no,
                result.awards.len()
            );
            for award in &result.awards {
                println!("  {} -> {:?}", award.subject, award.outcome);
            }
        }
        Command::Contest(ContestCommand::Cancel { id }) => {
            engine.contests().cancel(&id).await?;
            println!("contest {id} cancelled");
        }
        Command::Heist(HeistCommand::Start {
            context,
            channel,
            payload,
        }) => {
            let heist = engine
                .heists()
                .create(&ContextId::from(context), &ChannelId::from(channel), &payload)
                .await?;
            println!("heist {} created ({})", heist.id, heist.status);
        }
        Command::Heist(HeistCommand::Cancel { id }) => {
            let resolution = engine.heists().cancel(&id).await?;
            println!("heist {id}: {resolution:?}");
        }
    }

    Ok(())
}

fn contest_reward(
    balance: Option<String>,
    draws: Option<i64>,
    privilege: Option<String>,
    privilege_secs: Option<i64>,
) -> anyhow::Result<Reward> {
    let reward = match (balance, draws, privilege) {
        (Some(raw), None, None) => Reward::Balance {
            amount: amount::parse(&raw)?,
        },
        (None, Some(count), None) => Reward::Draws { count },
        (None, None, Some(privilege)) => match privilege_secs {
            Some(secs) => Reward::TimedPrivilege {
                privilege: PrivilegeId::from(privilege),
                duration_secs: secs,
            },
            None => Reward::Privilege {
                privilege: PrivilegeId::from(privilege),
            },
        },
        _ => bail!("pass exactly one of --balance, --draws or --privilege"),
    };
    Ok(reward)
}

fn open_db(path: &str) -> anyhow::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("opening database at {path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
