//! CLI helper functions

use crate::{
    config::{PipelineConfig, env},
    destination::PostgresDestination,
    etl::{MergeStatus, Pipeline, RunReport},
    source::PostgresSource,
    storage::S3Store,
    table::{MergePolicy, TableSpec},
};
use eyre::{Context, Result, bail};
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;

/// Which phases a command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Run,
    Extract,
    Load,
}

/// Load the pipeline file and its query files
pub fn load_config(path: impl AsRef<Path>) -> Result<(PipelineConfig, Vec<TableSpec>)> {
    let path = path.as_ref();
    log::info!("Loading pipeline config from {}", path.display());
    let config = PipelineConfig::read(path)?;
    let specs = config.table_specs()?;
    log::debug!("Config loaded: {} table(s)", specs.len());
    Ok((config, specs))
}

/// Restrict `specs` to `names`, keeping configuration order
///
/// An empty `names` selects every table.
pub fn select_tables(specs: Vec<TableSpec>, names: &[String]) -> Result<Vec<TableSpec>> {
    if names.is_empty() {
        return Ok(specs);
    }
    if let Some(unknown) = names.iter().find(|n| !specs.iter().any(|s| &s.name == *n)) {
        bail!("Table '{}' is not defined in the pipeline config", unknown);
    }
    Ok(specs
        .into_iter()
        .filter(|s| names.contains(&s.name))
        .collect())
}

/// Build the pipeline against PostgreSQL and S3 from the environment
///
/// Expected environment variables:
/// - `{SOURCE_CONNECTION}_URL` and `{DESTINATION_CONNECTION}_URL`
/// - `S3_ENDPOINT`, `S3_REGION`, `S3_ACCESS_KEY_ID`, `S3_SECRET_ACCESS_KEY` (optional)
pub async fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let source_url = env::connection_url(&config.source_connection)?;
    let source = PostgresSource::new(&source_url)
        .with_context(|| format!("Invalid {}", env::connection_var(&config.source_connection)))?;
    log::debug!("Source: {:?}", source);

    let destination_url = env::connection_url(&config.destination_connection)?;
    let destination = PostgresDestination::new(&destination_url, &config.schema).with_context(|| {
        format!(
            "Invalid {}",
            env::connection_var(&config.destination_connection)
        )
    })?;
    log::debug!("Destination: {:?}", destination);

    let settings = env::s3_settings()?;
    let store = S3Store::connect(&settings).await;

    Ok(Pipeline::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(destination),
        config.options(),
    ))
}

/// Execute `mode` for the selected tables
pub async fn run_pipeline(
    config_path: impl AsRef<Path>,
    tables: &[String],
    policy: Option<MergePolicy>,
    mode: Mode,
) -> Result<RunReport> {
    let (config, specs) = load_config(config_path)?;
    let specs = select_tables(specs, tables)?;

    if let Some(MergePolicy::Upsert) = policy
        && let Some(spec) = specs.iter().find(|s| !s.has_primary_key())
    {
        bail!(
            "Table '{}' declares no primary_key and cannot be upserted",
            spec.name
        );
    }

    let pipeline = build_pipeline(&config).await?;
    let report = match mode {
        Mode::Run => pipeline.run_with_policy(&specs, policy).await,
        Mode::Extract => pipeline.extract_only(&specs).await,
        Mode::Load => pipeline.load_only(&specs, policy).await,
    };
    Ok(report)
}

/// Validate the config and list its tables
pub fn check_config(config_path: impl AsRef<Path>) -> Result<usize> {
    let (config, specs) = load_config(config_path)?;

    println!(
        "{} bucket {} prefix /{}/ schema {}",
        "✓".green(),
        config.bucket.cyan(),
        config.staging_prefix.trim_matches('/'),
        config.schema.cyan()
    );
    for spec in &specs {
        let key = if spec.primary_key.is_empty() {
            "-".to_string()
        } else {
            spec.primary_key.join(", ")
        };
        println!(
            "  {:<20} {:<8} key: {}",
            spec.name.bold(),
            spec.policy_or(config.policy).to_string(),
            key.bright_black()
        );
    }
    Ok(specs.len())
}

/// Coloured per-table summary on stdout
pub fn print_summary(report: &RunReport) {
    for outcome in &report.outcomes {
        let extract = match &outcome.extract {
            Some(Ok(artifact)) => format!("{} bytes", artifact.byte_length).green().to_string(),
            Some(Err(_)) => "failed".red().to_string(),
            None => "-".bright_black().to_string(),
        };
        let merge = match &outcome.merge {
            MergeStatus::Merged(result) => format!("{} rows ({})", result.rows, result.policy)
                .green()
                .to_string(),
            MergeStatus::Failed(_) => "failed".red().to_string(),
            MergeStatus::Skipped => "skipped".yellow().to_string(),
            MergeStatus::NotRun => "-".bright_black().to_string(),
        };
        let mark = if outcome.is_success() {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        println!(
            "{} {:<20} extract: {:<24} merge: {}",
            mark, outcome.table, extract, merge
        );
        for error in outcome.errors() {
            println!(
                "    {} {}",
                error.phase.to_string().red(),
                error.source.bright_black()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn specs() -> Vec<TableSpec> {
        ["bookings", "tickets", "flights"]
            .iter()
            .map(|t| TableSpec::new(*t, format!("SELECT * FROM bookings.{}", t)))
            .collect()
    }

    #[test]
    fn test_select_tables_keeps_config_order() {
        let names = vec!["flights".to_string(), "bookings".to_string()];
        let selected = select_tables(specs(), &names).unwrap();
        let selected: Vec<_> = selected.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(selected, vec!["bookings", "flights"]);

        assert_eq!(select_tables(specs(), &[]).unwrap().len(), 3);
    }

    #[test]
    fn test_select_unknown_table() {
        let err = select_tables(specs(), &["seats".to_string()]).unwrap_err();
        assert!(err.to_string().contains("seats"));
    }

    #[test]
    fn test_check_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pipeline.yml");
        std::fs::write(
            &path,
            "tables:\n  - name: flights\n    query: SELECT 1\n    primary_key: [flight_id]\n",
        )
        .unwrap();
        assert_eq!(check_config(&path).unwrap(), 1);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_run_requires_connection_urls() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pipeline.yml");
        std::fs::write(&path, "tables:\n  - name: flights\n    query: SELECT 1\n").unwrap();
        unsafe {
            std::env::remove_var("SOURCE_DB_URL");
        }

        let err = run_pipeline(&path, &[], None, Mode::Run).await.unwrap_err();
        assert!(err.to_string().contains("SOURCE_DB_URL"));
    }

    #[tokio::test]
    async fn test_upsert_override_needs_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pipeline.yml");
        std::fs::write(&path, "tables:\n  - name: flights\n    query: SELECT 1\n").unwrap();

        let err = run_pipeline(&path, &[], Some(MergePolicy::Upsert), Mode::Load)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be upserted"));
    }
}
