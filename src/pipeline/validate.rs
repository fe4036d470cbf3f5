// src/pipeline/validate.rs

use std::path::Path;

use crate::error::Result;
use crate::models::Config;

/// Load and validate the configuration file, logging the effective values.
pub fn run_validate(config_path: &Path) -> Result<Config> {
    log::info!("Validating {}", config_path.display());

    let config = match Config::load(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
    };

    log::info!("✓ Config OK");
    log::info!("  user_agent: {}", config.crawler.user_agent);
    log::info!(
        "  timeouts: {}s per fetch, {}s per batch",
        config.crawler.timeout_secs,
        config.crawler.batch_timeout_secs
    );
    log::info!("  max_concurrent: {}", config.crawler.max_concurrent);
    log::info!(
        "  feed limits: {} posts, {} bytes",
        config.feed.max_posts_per_feed,
        config.feed.max_feed_size_bytes
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_config_passes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[crawler]\nmax_concurrent = 2\n").unwrap();

        let config = run_validate(&path).unwrap();
        assert_eq!(config.crawler.max_concurrent, 2);
    }

    #[test]
    fn test_batch_timeout_shorter_than_fetch_timeout_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[crawler]\ntimeout_secs = 30\nbatch_timeout_secs = 5\n").unwrap();

        assert!(run_validate(&path).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(run_validate(&tmp.path().join("nope.toml")).is_err());
    }
}
