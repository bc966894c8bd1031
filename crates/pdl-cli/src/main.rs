use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pdl_core::TableName;
use pdl_sync::{
    run_scheduler_until_ctrl_c, verify_only, ConnectionParams, Pipeline, PipelineConfig,
    ReadStage, RunContext, Stage, WriteStage,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdl")]
#[command(about = "Prompt dataset loader command-line interface")]
struct Cli {
    /// Pipeline YAML; defaults to $PDL_CONFIG, then ./pipeline.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Positional Postgres coordinates.
#[derive(Debug, Args)]
struct ConnectionArgs {
    host: String,
    database: String,
    user: String,
    password: String,
    port: u16,
}

impl From<ConnectionArgs> for ConnectionParams {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionParams::new(args.host, args.database, args.user, args.password, args.port)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the dataset page to disk and load it into the write table.
    Write(ConnectionArgs),
    /// Fetch the dataset page directly, load it into the read table and log its contents.
    Read(ConnectionArgs),
    /// Log the row count and first rows of a table.
    Verify {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long)]
        table: Option<TableName>,
        #[arg(long)]
        preview: Option<usize>,
    },
    /// Run Start → Write → Read → End once, using POSTGRES_* for the connection.
    Run,
    /// Run the pipeline on its cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Write(args) => {
            let stage = WriteStage::from_config(&config, args.into())?;
            let output = stage.run(&RunContext::new()).await?;
            if let Some(write) = output.write {
                println!(
                    "write complete: table={} fetched={} inserted={} skipped={}",
                    config.write_table(),
                    write.fetched,
                    write.inserted,
                    write.skipped
                );
            }
        }
        Commands::Read(args) => {
            let stage = ReadStage::from_config(&config, args.into())?;
            let output = stage.run(&RunContext::new()).await?;
            println!(
                "read complete: table={} inserted={} rows={}",
                config.read_table(),
                output.write.map(|w| w.inserted).unwrap_or(0),
                output
                    .verified_rows
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unavailable".to_string())
            );
        }
        Commands::Verify {
            connection,
            table,
            preview,
        } => {
            let table = table.unwrap_or_else(|| config.read_table());
            let preview = preview.unwrap_or(config.preview_rows);
            let connection: ConnectionParams = connection.into();
            let report = verify_only(&connection, &table, preview).await?;
            match report {
                Some(report) => println!("verify complete: table={table} rows={}", report.row_count),
                None => println!("verify complete: table={table} rows=unavailable"),
            }
        }
        Commands::Run => {
            let pipeline = Pipeline::from_config(config, ConnectionParams::from_env()?)?;
            let summary = pipeline.run_once().await?;
            let inserted: usize = summary
                .stages
                .iter()
                .filter_map(|s| s.output.write.map(|w| w.inserted))
                .sum();
            println!(
                "pipeline complete: run_id={} stages={} inserted={}",
                summary.run_id,
                summary.stages.len(),
                inserted
            );
        }
        Commands::Schedule => {
            let pipeline = Pipeline::from_config(config, ConnectionParams::from_env()?)?;
            run_scheduler_until_ctrl_c(Arc::new(pipeline)).await?;
        }
    }

    Ok(())
}
