use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wdstat_core::AreaKind;
use wdstat_sync::{CandidateSource, DiscoveryQuery, Selection, SyncRunSummary};

#[derive(Debug, Parser)]
#[command(name = "wdstat")]
#[command(about = "Keeps locality population and area statements in line with the statistics dataset")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile entities against the dataset and submit the changes.
    Sync(SyncArgs),
    /// Replace legacy references on claims added by earlier runs.
    FixReferences {
        #[arg(long, default_value = "urban")]
        kind: AreaKind,
    },
    /// Print candidate entity ids from a built-in query.
    Discover {
        #[arg(long, default_value = "urban")]
        kind: AreaKind,
        #[arg(long)]
        query: DiscoveryQuery,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, default_value = "urban")]
    kind: AreaKind,
    /// Comma-separated entity ids.
    #[arg(long, value_delimiter = ',', conflicts_with = "query")]
    ids: Vec<String>,
    /// Built-in discovery query supplying the candidates.
    #[arg(long)]
    query: Option<DiscoveryQuery>,
    #[arg(long, default_value_t = 0)]
    skip: usize,
    #[arg(long)]
    take: Option<usize>,
    /// Also revisit entities a previous run already completed.
    #[arg(long)]
    include_complete: bool,
}

fn report(summary: &SyncRunSummary) -> Result<()> {
    println!("{summary}");
    if !summary.is_completed() {
        bail!("run aborted");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => {
            let source = match args.query {
                Some(query) => CandidateSource::Query(query),
                None if !args.ids.is_empty() => CandidateSource::Ids(args.ids),
                None => bail!("pass --ids or --query"),
            };
            let selection = Selection {
                skip: args.skip,
                take: args.take,
                include_complete: args.include_complete,
            };
            let summary = wdstat_sync::run_sync_from_env(args.kind, source, selection).await?;
            report(&summary)?;
        }
        Commands::FixReferences { kind } => {
            let summary = wdstat_sync::run_reference_repair_from_env(kind).await?;
            report(&summary)?;
        }
        Commands::Discover { kind, query } => {
            let ids = wdstat_sync::discover_from_env(kind, query).await?;
            for id in &ids {
                println!("{id}");
            }
            eprintln!("{} candidates for {query} ({kind})", ids.len());
        }
    }

    Ok(())
}
