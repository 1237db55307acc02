//! CLI for replica maintenance and a local demo group

use clap::{Parser, Subcommand};
use quorumlog::common::{parse_duration, Config};
use quorumlog::ops::{compact_replica, inspect_replica, verify_replica};
use quorumlog::{LocalCluster, LogConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumlog")]
#[command(about = "quorumlog replicated log tools")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a replica's promise, bounds and unlearned positions
    Inspect {
        /// Replica data directory
        #[arg(long)]
        data: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check every record of a replica's record file
    Verify {
        /// Replica data directory
        #[arg(long)]
        data: PathBuf,
    },

    /// Drop truncated and superseded records
    Compact {
        /// Replica data directory
        #[arg(long)]
        data: PathBuf,
    },

    /// Run a group in this process, append payloads and read them back
    Demo {
        /// Number of replicas
        #[arg(long, default_value = "3")]
        replicas: u64,

        /// Quorum size
        #[arg(long, default_value = "2")]
        quorum: usize,

        /// Parent directory for the replicas' data
        #[arg(long, default_value = "./quorumlog-demo")]
        data: PathBuf,

        /// Per-operation timeout (e.g. 500ms, 5s)
        #[arg(long, default_value = "5s")]
        timeout: String,

        /// Payloads to append
        #[arg(required = true)]
        payloads: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Inspect { data, json } => {
            let report = inspect_replica(&data)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            let summary = &report.summary;
            println!("Replica {}:", data.display());
            println!("  Membership: {}", summary.membership);
            println!("  Promised: {}", summary.promised);
            println!("  Beginning: {}", summary.beginning);
            match summary.ending {
                Some(ending) => println!("  Ending: {}", ending),
                None => println!("  Ending: (empty)"),
            }
            println!("  Actions: {} ({} learned)", summary.actions, summary.learned);
            println!("  Records: {}", summary.records);
            println!("  Unlearned positions: {:?}", report.missing);
        }

        Commands::Verify { data } => {
            let report = verify_replica(&data)?;
            println!("Verification report:");
            println!("  Records: {}", report.records);
            println!("  Valid bytes: {}", report.valid_bytes);
            println!("  Total bytes: {}", report.total_bytes);
            if let Some(error) = &report.error {
                println!("  Error: {}", error);
            }
            if !report.is_healthy() {
                anyhow::bail!(
                    "{} corrupt bytes at the end of the record file",
                    report.corrupt_bytes()
                );
            }
        }

        Commands::Compact { data } => {
            let report = compact_replica(&data)?;
            println!("Compaction report:");
            println!("  Records dropped: {}", report.records_dropped);
            println!("  Bytes freed: {}", report.bytes_freed());
        }

        Commands::Demo {
            replicas,
            quorum,
            data,
            timeout,
            payloads,
        } => {
            let timeout = parse_duration(&timeout)?;
            let members = demo_members(replicas, quorum)?;
            let base = config.log.unwrap_or_default();
            let cluster = LocalCluster::new(members.clone());

            let mut logs = Vec::new();
            for id in &members {
                let log_config = LogConfig {
                    replica_id: *id,
                    quorum,
                    members: members.clone(),
                    data_dir: data.join(format!("replica-{}", id)),
                    bootstrap: true,
                    ..base.clone()
                };
                logs.push(cluster.open_log(log_config).await?);
            }

            let writer = logs[0].writer(timeout, 3).await?;
            let mut last = None;
            for payload in payloads {
                let position = writer.append(payload.into_bytes(), timeout).await?;
                println!("Appended at position {} ({})", position, hex::encode(position.identity()));
                last = Some(position);
            }

            if let Some(last) = last {
                let reader = logs[logs.len() - 1].reader();
                let first = reader.beginning().await?;
                let entries = reader.read(first, last, timeout).await?;
                println!("Read back {} entries:", entries.len());
                for entry in entries {
                    println!(
                        "  {}: {}",
                        entry.position,
                        String::from_utf8_lossy(&entry.data)
                    );
                }
                match last.next() {
                    Some(next) => println!("Next position: {}", next),
                    None => println!("Log is full"),
                }
            }

            for log in logs {
                log.close().await?;
            }
        }
    }

    Ok(())
}

/// Member ids for a demo group of `replicas` replicas.
fn demo_members(replicas: u64, quorum: usize) -> anyhow::Result<Vec<u64>> {
    anyhow::ensure!(replicas >= 1, "a demo group needs at least one replica");
    anyhow::ensure!(
        quorum >= 1 && quorum as u64 <= replicas,
        "quorum {} must be between 1 and the {} replicas",
        quorum,
        replicas
    );
    Ok((1..=replicas).collect())
}
