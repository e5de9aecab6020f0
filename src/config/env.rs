//! Secrets from environment variables
//!
//! Expected environment variables:
//! - `{ID}_URL`: connection URL for each connection id (e.g. `SOURCE_DB_URL`)
//! - `S3_ENDPOINT`: custom object store endpoint (optional, e.g. MinIO)
//! - `S3_REGION`: region (optional, defaults to `us-east-1`)
//! - `S3_ACCESS_KEY_ID` / `S3_SECRET_ACCESS_KEY`: static credentials (optional)

use crate::storage::S3Settings;
use eyre::{Context, Result, bail};
use url::Url;

/// Environment variable holding the URL of connection `id`
pub fn connection_var(id: &str) -> String {
    format!("{}_URL", id.to_uppercase())
}

/// Connection URL for `id`, e.g. `source_db` reads `SOURCE_DB_URL`
pub fn connection_url(id: &str) -> Result<String> {
    let var = connection_var(id);
    std::env::var(&var)
        .with_context(|| format!("{} environment variable not set (connection '{}')", var, id))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Object store settings
pub fn s3_settings() -> Result<S3Settings> {
    let endpoint = match optional("S3_ENDPOINT") {
        Some(raw) => {
            // MinIO setups often give a bare host:port
            let raw = if raw.contains("://") {
                raw
            } else {
                format!("http://{}", raw)
            };
            Some(Url::parse(&raw).with_context(|| format!("Invalid S3_ENDPOINT: {}", raw))?)
        }
        None => None,
    };

    let access_key_id = optional("S3_ACCESS_KEY_ID");
    let secret_access_key = optional("S3_SECRET_ACCESS_KEY");
    if access_key_id.is_some() != secret_access_key.is_some() {
        bail!("S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together");
    }

    Ok(S3Settings {
        endpoint,
        region: optional("S3_REGION").unwrap_or_else(|| S3Settings::default().region),
        access_key_id,
        secret_access_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_s3() {
        unsafe {
            std::env::remove_var("S3_ENDPOINT");
            std::env::remove_var("S3_REGION");
            std::env::remove_var("S3_ACCESS_KEY_ID");
            std::env::remove_var("S3_SECRET_ACCESS_KEY");
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_connection_url() {
        unsafe {
            std::env::set_var("SOURCE_DB_URL", "postgres://etl@localhost/demo");
            std::env::remove_var("STAGING_DB_URL");
        }

        assert_eq!(
            connection_url("source_db").unwrap(),
            "postgres://etl@localhost/demo"
        );
        let err = connection_url("staging_db").unwrap_err();
        assert!(err.to_string().contains("STAGING_DB_URL"));

        unsafe {
            std::env::remove_var("SOURCE_DB_URL");
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_s3_defaults() {
        clear_s3();
        let settings = s3_settings().unwrap();
        assert_eq!(settings, S3Settings::default());
    }

    #[test]
    #[serial_test::serial]
    fn test_s3_minio_settings() {
        clear_s3();
        unsafe {
            std::env::set_var("S3_ENDPOINT", "localhost:9000");
            std::env::set_var("S3_ACCESS_KEY_ID", "minio");
            std::env::set_var("S3_SECRET_ACCESS_KEY", "minio123");
        }

        let settings = s3_settings().unwrap();
        assert_eq!(settings.endpoint.unwrap().as_str(), "http://localhost:9000/");
        assert_eq!(settings.access_key_id.as_deref(), Some("minio"));
        assert_eq!(settings.region, "us-east-1");

        clear_s3();
    }

    #[test]
    #[serial_test::serial]
    fn test_s3_partial_credentials() {
        clear_s3();
        unsafe {
            std::env::set_var("S3_ACCESS_KEY_ID", "minio");
        }

        let err = s3_settings().unwrap_err();
        assert!(err.to_string().contains("set together"));

        clear_s3();
    }
}
