use clap::{Parser, Subcommand, builder::styling};
use eyre::{Result, bail};
use owo_colors::OwoColorize;
use stagepipe::cli::{Mode, check_config, print_summary, run_pipeline};
use stagepipe::table::MergePolicy;
use std::path::Path;

// CLI Styling
const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::BrightWhite.on_default())
    .usage(styling::AnsiColor::BrightWhite.on_default())
    .literal(styling::AnsiColor::Green.on_default())
    .placeholder(styling::AnsiColor::Cyan.on_default());

/// Stagepipe: extract tables to an object-store staging area and merge them into a staging schema
#[derive(Parser)]
#[command(name = "stagepipe", version, styles = STYLES)]
struct Cli {
    /// The dotenv file to source connection URLs and keys from
    #[arg(short, long, global = true, default_value = ".env")]
    env: String,

    /// The pipeline definition
    #[arg(short, long, global = true, default_value = "pipeline.yml")]
    config: String,

    /// More verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every table, then merge every table that extracted cleanly
    Run {
        /// Comma-separated subset of tables to process
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Merge policy for every selected table, overriding the config
        #[arg(short, long, value_enum)]
        policy: Option<MergePolicy>,
    },

    /// Stage tables without merging them
    Extract {
        /// Comma-separated subset of tables to process
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Merge the currently staged artifacts
    Load {
        /// Comma-separated subset of tables to process
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Merge policy for every selected table, overriding the config
        #[arg(short, long, value_enum)]
        policy: Option<MergePolicy>,
    },

    /// Validate the pipeline definition and list its tables
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if Path::new(&cli.env).exists() {
        dotenvy::from_filename(&cli.env)?;
    }

    let log_level = match cli.debug {
        true => "debug",
        false => "info",
    };
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    let (mode, tables, policy) = match cli.command {
        Commands::Check => {
            let count = check_config(&cli.config)?;
            log::info!("{} table(s) configured", count);
            return Ok(());
        }
        Commands::Run { tables, policy } => (Mode::Run, tables, policy),
        Commands::Extract { tables } => (Mode::Extract, tables, None),
        Commands::Load { tables, policy } => (Mode::Load, tables, policy),
    };

    log::info!(
        "Starting {} for {}",
        format!("{:?}", mode).to_lowercase().cyan(),
        match tables.is_empty() {
            true => "all tables".to_string(),
            false => tables.join(", "),
        }
        .bright_black()
    );

    let report = run_pipeline(&cli.config, &tables, policy, mode).await?;
    print_summary(&report);

    let failed = report.failed().count();
    if failed > 0 {
        bail!("{} table failure(s), see the log for details", failed);
    }
    Ok(())
}
