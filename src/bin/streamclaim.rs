use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tokio::runtime;
use tracing::info;

use streamclaim::log::{EntryId, LogClient};
use streamclaim::service::setup_tracing;
use streamclaim::{AppResult, ClaimConfig, LoggingProcessor, MemoryLog, RedisLog, Supervisor};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// log backend to run against
    #[arg(long, value_enum, default_value_t = Backend::Redis)]
    pub backend: Backend,
    /// number of entries to publish, overrides stream.message_count
    #[arg(long)]
    pub count: Option<u64>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Redis,
    Memory,
}

#[derive(Subcommand)]
pub enum Command {
    /// publish, consume and reclaim until the target count is reached
    Run,
    /// print the effective configuration with secrets masked
    PrintConfig,
    /// list the consumer group's pending entries
    Pending {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let mut config = ClaimConfig::set_up_config(commandline.conf.as_deref())?;
    if let Some(count) = commandline.count {
        config.stream.message_count = count;
    }

    let command = commandline.command.unwrap_or(Command::Run);
    if let Command::PrintConfig = command {
        println!("{:#?}", config.redacted());
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let level = match commandline.verbose {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _telemetry_guard = rt.block_on(setup_tracing(&config.telemetry, level))?;

    rt.block_on(async move {
        match commandline.backend {
            Backend::Memory => run_with(Arc::new(MemoryLog::new()), config, command).await,
            Backend::Redis => {
                let nodes = config.redis_nodes()?.to_vec();
                let password = config.redis.password.clone();
                if nodes.len() == 1 {
                    let log = RedisLog::connect_standalone(&nodes[0], password.as_deref()).await?;
                    run_with(Arc::new(log), config, command).await
                } else {
                    let log = RedisLog::connect_cluster(&nodes, password.as_deref()).await?;
                    run_with(Arc::new(log), config, command).await
                }
            }
        }
    })
}

async fn run_with<L: LogClient>(log: Arc<L>, config: ClaimConfig, command: Command) -> AppResult<()> {
    match command {
        Command::Pending { limit } => {
            let pending = log
                .pending(&config.stream.key, &config.stream.group, &EntryId::MIN, limit)
                .await?;
            for entry in &pending {
                println!(
                    "{}\t{}\tidle={}ms\tdeliveries={}",
                    entry.id,
                    entry.consumer,
                    entry.idle.as_millis(),
                    entry.delivery_count
                );
            }
            info!(count = pending.len(), "pending entries listed");
            Ok(())
        }
        Command::Run | Command::PrintConfig => {
            let summary = Supervisor::new(log, config, LoggingProcessor).run().await?;
            info!(?summary, "streamclaim finished");
            Ok(())
        }
    }
}
