use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tgh_adapters::connector_for;
use tgh_collect::{format_dhms, read_snapshot_keys, ChannelList, Collector, JobSettings};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tgh-cli")]
#[command(about = "Telegram Group Harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect a date window of messages from one or more channels.
    Collect(CollectArgs),
    /// Print the rows held by a snapshot file.
    Inspect { file: PathBuf },
}

#[derive(Debug, Default, Args)]
struct CollectArgs {
    /// YAML job file; flags override its values, which override TGH_* variables.
    #[arg(long)]
    job: Option<PathBuf>,
    #[arg(long)]
    job_name: Option<String>,
    /// Comma-separated channel handles.
    #[arg(long)]
    channels: Option<String>,
    #[arg(long)]
    date_min: Option<String>,
    #[arg(long)]
    date_max: Option<String>,
    #[arg(long)]
    key_search: Option<String>,
    #[arg(long)]
    max_count: Option<u64>,
    /// Seconds.
    #[arg(long)]
    time_limit: Option<u64>,
    /// parquet or csv
    #[arg(long)]
    format: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// web or fixture
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    fixtures_dir: Option<PathBuf>,
    #[arg(long)]
    user_agent: Option<String>,
    /// Minimum seconds spent per channel.
    #[arg(long)]
    group_floor: Option<u64>,
}

impl CollectArgs {
    fn into_settings(self) -> JobSettings {
        JobSettings {
            job_name: self.job_name,
            channels: self.channels.map(ChannelList::Joined),
            date_min: self.date_min,
            date_max: self.date_max,
            key_search: self.key_search,
            max_count: self.max_count,
            time_limit_secs: self.time_limit,
            format: self.format,
            output_dir: self.output_dir,
            source: self.source,
            fixtures_dir: self.fixtures_dir,
            user_agent: self.user_agent,
            group_floor_secs: self.group_floor,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tgh=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Collect(CollectArgs::default())) {
        Commands::Collect(args) => collect(args).await?,
        Commands::Inspect { file } => {
            let keys = read_snapshot_keys(&file)?;
            println!(
                "{}: rows={} first={:?} last={:?}",
                file.display(),
                keys.len(),
                keys.first(),
                keys.last()
            );
        }
    }

    Ok(())
}

async fn collect(mut args: CollectArgs) -> Result<()> {
    let mut settings = JobSettings::from_env()?;
    if let Some(job) = args.job.take() {
        settings = settings.merge(JobSettings::from_yaml_file(&job)?);
    }
    let config = settings
        .merge(args.into_settings())
        .resolve()
        .context("invalid collection job")?;
    config.log();

    let connector = connector_for(config.source, &config.connector_settings());
    let outcome = Collector::new(config, connector).run().await?;
    let summary = outcome.summary;

    let elapsed = (summary.finished_at - summary.started_at)
        .to_std()
        .unwrap_or_default();
    println!(
        "collect complete: run_id={} records={} groups={} stop={} elapsed={} final={}",
        summary.run_id,
        summary.total_records,
        summary.groups.len(),
        summary
            .stop_reason
            .map(|r| format!("{r:?}"))
            .unwrap_or_else(|| "exhausted".to_string()),
        format_dhms(elapsed),
        summary.final_snapshot.display()
    );
    Ok(())
}
