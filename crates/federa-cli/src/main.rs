//! Federa CLI - query configured geospatial datasources from the terminal
//!
//! Datasources are read from a YAML or JSON config file; every command
//! prints its result as pretty JSON on stdout.

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    CountCommand, GetCommand, MetadataCommand, ProbeCommand, QueryCommand, SearchCommand,
    SelectBoxCommand,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Datasource config file (YAML, or JSON by extension)
    #[arg(
        long,
        short = 'c',
        default_value = "federa.yaml",
        env = "FEDERA_CONFIG",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "FEDERA_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "FEDERA_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List feature types, or show the descriptors of some
    Metadata(MetadataCommand),
    /// Fetch one feature by id
    Get(GetCommand),
    /// Query features of a type
    Query(QueryCommand),
    /// Count features of a type
    Count(CountCommand),
    /// Select features inside a bounding box
    SelectBox(SelectBoxCommand),
    /// Free text search
    Search(SearchCommand),
    /// Check that a datasource initialises and accepts its credentials
    Probe(ProbeCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.clone();

    // RUST_LOG wins; otherwise federa crates at the requested level
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::try_from_default_env()
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG environment variable: {}", e))?,
        Err(_) => tracing_subscriber::EnvFilter::new(format!(
            "federa_cli={level},\
             federa_query={level},\
             federa_query_rest={level},\
             federa_query_esri={level},\
             federa_query_ogc={level},\
             h2=warn,\
             hyper=warn,\
             reqwest=warn,\
             rustls=warn",
            level = log_level
        )),
    };

    // Logs go to stderr so stdout stays valid JSON
    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    match cli.command {
        Commands::Metadata(cmd) => cmd.execute(&cli.config),
        Commands::Get(cmd) => cmd.execute(&cli.config),
        Commands::Query(cmd) => cmd.execute(&cli.config),
        Commands::Count(cmd) => cmd.execute(&cli.config),
        Commands::SelectBox(cmd) => cmd.execute(&cli.config),
        Commands::Search(cmd) => cmd.execute(&cli.config),
        Commands::Probe(cmd) => cmd.execute(&cli.config),
    }
}
