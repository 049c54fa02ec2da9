//! Local profile: who this device is and how its engine is tuned.
//!
//! Stored as `clipmesh.toml` in the data directory:
//!
//! ```toml
//! [device]
//! instance_id = "3f2a..."
//! device_name = "Desk"
//! created_at = 1760000000
//!
//! [engine.polling]
//! base_interval_ms = 60000
//! # ...
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sync_client::EngineConfig;
use sync_types::{DeviceIdentity, HostInfo, InstanceId, Platform, SyncInfo};

/// File name of the profile inside the data directory.
pub const PROFILE_FILE: &str = "clipmesh.toml";

/// Identity this device announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDevice {
    /// Stable instance id of this install.
    pub instance_id: InstanceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Unix seconds of `init`.
    pub created_at: u64,
}

impl LocalDevice {
    /// A fresh identity named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            instance_id: InstanceId::random(),
            device_name: name.to_string(),
            created_at: sync_client::now_millis() / 1000,
        }
    }

    /// What this device announces to peers at `host:port`.
    pub fn sync_info(&self, host: &str, port: u16) -> SyncInfo {
        SyncInfo {
            identity: DeviceIdentity {
                instance_id: self.instance_id.clone(),
                device_id: self.instance_id.to_string(),
                device_name: self.device_name.clone(),
                platform: local_platform(),
            },
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            host_info_list: vec![HostInfo::new(host, 24)],
            port,
        }
    }
}

/// Device identity plus the engine settings chosen at `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// This device.
    pub device: LocalDevice,
    /// Engine settings; missing sections take their defaults.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Profile {
    /// Profile location in `data_dir`.
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(PROFILE_FILE)
    }

    /// Whether `data_dir` holds a profile.
    pub async fn exists(data_dir: &Path) -> bool {
        tokio::fs::try_exists(Self::path(data_dir))
            .await
            .unwrap_or(false)
    }

    /// Read the profile in `data_dir`.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Device not initialized. Run 'sync-cli init' first.")?;
        toml::from_str(&contents).with_context(|| format!("Invalid profile {}", path.display()))
    }

    /// Write the profile to `data_dir`, readable by the owner only.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path(data_dir);
        let contents = toml::to_string_pretty(self).context("Failed to encode profile")?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        restrict(&path, 0o600).await
    }

    /// Engine settings for a command: an explicit `--config` file wins,
    /// then the profile, then the defaults.
    pub async fn engine_config(data_dir: &Path, explicit: Option<&Path>) -> Result<EngineConfig> {
        if let Some(path) = explicit {
            return Ok(EngineConfig::from_file(path)?);
        }
        if Self::exists(data_dir).await {
            return Ok(Self::load(data_dir).await?.engine);
        }
        Ok(EngineConfig::default())
    }
}

/// Platform descriptor of the running binary.
pub fn local_platform() -> Platform {
    Platform {
        name: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        bit_mode: if cfg!(target_pointer_width = "64") { 64 } else { 32 },
        version: String::new(),
    }
}

/// Create `data_dir` if needed and close it to other users.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    restrict(data_dir, 0o700).await
}

async fn restrict(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("Failed to restrict {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile(name: &str) -> Profile {
        Profile {
            device: LocalDevice::new(name),
            engine: EngineConfig::default(),
        }
    }

    #[tokio::test]
    async fn profile_keeps_device_and_engine_settings() {
        let dir = tempdir().unwrap();
        assert!(!Profile::exists(dir.path()).await);

        let mut saved = profile("Desk");
        saved.engine.polling.base_interval_ms = 20_000;
        saved.engine.pull.chunk_size = 256 * 1024;
        saved.save(dir.path()).await.unwrap();

        assert!(Profile::exists(dir.path()).await);
        assert_eq!(Profile::load(dir.path()).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn engine_sections_default_when_missing() {
        let dir = tempdir().unwrap();
        std::fs::write(
            Profile::path(dir.path()),
            "[device]\ninstance_id = \"abc\"\ndevice_name = \"Desk\"\ncreated_at = 1\n\n[engine.pull]\nmax_concurrency = 3\n",
        )
        .unwrap();

        let loaded = Profile::load(dir.path()).await.unwrap();
        assert_eq!(loaded.device.instance_id.as_str(), "abc");
        assert_eq!(loaded.engine.pull.max_concurrency, 3);
        assert_eq!(loaded.engine.polling, EngineConfig::default().polling);
    }

    #[tokio::test]
    async fn explicit_config_file_wins_over_profile() {
        let dir = tempdir().unwrap();
        let mut saved = profile("Desk");
        saved.engine.pull.chunk_size = 4096;
        saved.save(dir.path()).await.unwrap();

        assert_eq!(
            Profile::engine_config(dir.path(), None).await.unwrap().pull.chunk_size,
            4096
        );

        let explicit = dir.path().join("engine.toml");
        std::fs::write(&explicit, "[pull]\nchunk_size = 8192\n").unwrap();
        let config = Profile::engine_config(dir.path(), Some(&explicit)).await.unwrap();
        assert_eq!(config.pull.chunk_size, 8192);

        let empty = tempdir().unwrap();
        assert_eq!(
            Profile::engine_config(empty.path(), None).await.unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn sync_info_announces_identity() {
        let device = LocalDevice::new("Desk");
        let info = device.sync_info("192.168.1.20", 13129);
        assert_eq!(info.instance_id(), &device.instance_id);
        assert_eq!(info.host_info_list, vec![HostInfo::new("192.168.1.20", 24)]);
        assert_eq!(info.port, 13129);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn profile_and_data_dir_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        ensure_data_dir(&data_dir).await.unwrap();
        profile("Desk").save(&data_dir).await.unwrap();

        let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&data_dir), 0o700);
        assert_eq!(mode(&Profile::path(&data_dir)), 0o600);
    }
}
