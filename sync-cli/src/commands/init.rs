//! Create the local profile.

use anyhow::Result;
use std::path::Path;
use sync_client::EngineConfig;

use crate::config::{LocalDevice, Profile};

/// Engine settings `init` may override.
#[derive(Debug, Clone, Default)]
pub struct Seeds {
    /// Healthy-link poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Base of the failure backoff in milliseconds.
    pub retry_base_ms: Option<u64>,
    /// Transfer chunk size in bytes.
    pub chunk_size: Option<u64>,
    /// Concurrent chunk requests per transfer.
    pub max_concurrency: Option<usize>,
}

impl Seeds {
    /// `base` with the given overrides applied.
    pub fn apply(&self, mut base: EngineConfig) -> Result<EngineConfig> {
        if let Some(ms) = self.poll_interval_ms {
            base.polling.base_interval_ms = ms;
        }
        if let Some(ms) = self.retry_base_ms {
            base.polling.retry_base_ms = ms;
        }
        if let Some(size) = self.chunk_size {
            base.pull.chunk_size = size;
        }
        if let Some(n) = self.max_concurrency {
            base.pull.max_concurrency = n;
        }

        if base.polling.base_interval_ms == 0 {
            anyhow::bail!("Poll interval must be positive");
        }
        if base.polling.retry_base_ms > base.polling.base_interval_ms {
            anyhow::bail!(
                "Retry base ({} ms) exceeds the poll interval ({} ms)",
                base.polling.retry_base_ms,
                base.polling.base_interval_ms
            );
        }
        if base.pull.chunk_size == 0 {
            anyhow::bail!("Chunk size must be positive");
        }
        if base.pull.max_concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        Ok(base)
    }
}

/// Write a new profile for `name` with `base` tuned by `seeds`.
pub async fn create(
    data_dir: &Path,
    name: &str,
    base: EngineConfig,
    seeds: &Seeds,
) -> Result<Profile> {
    if Profile::exists(data_dir).await {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            Profile::path(data_dir).display()
        );
    }

    let profile = Profile {
        device: LocalDevice::new(name),
        engine: seeds.apply(base)?,
    };
    profile.save(data_dir).await?;
    Ok(profile)
}

/// Run the init command.
pub async fn run(data_dir: &Path, name: &str, base: EngineConfig, seeds: &Seeds) -> Result<()> {
    let profile = create(data_dir, name, base, seeds).await?;
    let engine = &profile.engine;
    let longest = engine
        .polling
        .backoff_policy()
        .failure_delay(engine.polling.max_power);

    println!("Device initialized: {}", profile.device.device_name);
    println!("  Instance ID:  {}", profile.device.instance_id);
    println!("  Profile:      {}", Profile::path(data_dir).display());
    println!(
        "  Polling:      every {} ms, retries from {} ms up to {} ms",
        engine.polling.base_interval_ms,
        engine.polling.retry_base_ms,
        longest.as_millis()
    );
    println!(
        "  Transfers:    {} byte chunks, {} at a time",
        engine.pull.chunk_size, engine.pull.max_concurrency
    );
    println!();
    println!("Share a pairing payload with: sync-cli invite encode --host <ip>");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_seeds_engine_settings() {
        let dir = tempdir().unwrap();
        let seeds = Seeds {
            poll_interval_ms: Some(30_000),
            chunk_size: Some(512 * 1024),
            ..Seeds::default()
        };
        create(dir.path(), "Desk", EngineConfig::default(), &seeds)
            .await
            .unwrap();

        let profile = Profile::load(dir.path()).await.unwrap();
        assert_eq!(profile.device.device_name, "Desk");
        assert_eq!(profile.engine.polling.base_interval_ms, 30_000);
        assert_eq!(profile.engine.polling.retry_base_ms, 500);
        assert_eq!(profile.engine.pull.chunk_size, 512 * 1024);
        assert_eq!(profile.engine.pull.max_concurrency, 10);
    }

    #[tokio::test]
    async fn init_fails_if_already_initialized() {
        let dir = tempdir().unwrap();
        let first = create(dir.path(), "Desk", EngineConfig::default(), &Seeds::default())
            .await
            .unwrap();

        let again = create(dir.path(), "Laptop", EngineConfig::default(), &Seeds::default()).await;
        assert!(again.is_err());
        assert_eq!(Profile::load(dir.path()).await.unwrap(), first);
    }

    #[test]
    fn seeds_reject_unusable_settings() {
        let base = EngineConfig::default;
        let zero_chunks = Seeds {
            chunk_size: Some(0),
            ..Seeds::default()
        };
        assert!(zero_chunks.apply(base()).is_err());

        let no_concurrency = Seeds {
            max_concurrency: Some(0),
            ..Seeds::default()
        };
        assert!(no_concurrency.apply(base()).is_err());

        let inverted = Seeds {
            poll_interval_ms: Some(100),
            retry_base_ms: Some(1_000),
            ..Seeds::default()
        };
        assert!(inverted.apply(base()).is_err());
    }

    #[tokio::test]
    async fn base_config_carries_through() {
        let dir = tempdir().unwrap();
        let mut base = EngineConfig::default();
        base.handler.address_wait_ms = 250;

        let profile = create(dir.path(), "Desk", base, &Seeds::default())
            .await
            .unwrap();
        assert_eq!(profile.engine.handler.address_wait_ms, 250);
    }
}
