//! Encode and decode pairing payloads.

use anyhow::{Context, Result};
use std::path::Path;
use sync_core::{PairingToken, SyncInfoPayload};

use crate::config::{LocalDevice, Profile};

/// Build the payload for this device. Returns the payload and the token in it.
pub async fn build(
    data_dir: &Path,
    name: Option<&str>,
    host: &str,
    port: u16,
    token: Option<&str>,
) -> Result<(String, PairingToken)> {
    let device = if Profile::exists(data_dir).await {
        let mut device = Profile::load(data_dir).await?.device;
        if let Some(name) = name {
            device.device_name = name.to_string();
        }
        device
    } else {
        let name = name.context("Device not initialized. Run 'sync-cli init' or pass --name.")?;
        LocalDevice::new(name)
    };

    let token = match token {
        Some(code) => code.parse::<PairingToken>().context("Invalid --token")?,
        None => PairingToken::generate()?,
    };
    let payload = SyncInfoPayload::new(device.sync_info(host, port), token).encode()?;
    Ok((payload, token))
}

/// Run `invite encode`.
pub async fn encode(
    data_dir: &Path,
    name: Option<&str>,
    host: &str,
    port: u16,
    token: Option<&str>,
) -> Result<()> {
    let (payload, token) = build(data_dir, name, host, port, token).await?;

    println!("{}", payload);
    eprintln!();
    eprintln!("Pairing token: {}", token);
    eprintln!("The token is single-use; share the payload with one device only.");
    Ok(())
}

/// Run `invite decode`.
pub fn decode(payload: &str) -> Result<()> {
    let decoded = SyncInfoPayload::decode(payload.trim()).context("Invalid pairing payload")?;
    let info = &decoded.sync_info;

    println!("Device:   {}", info.identity.device_name);
    println!("Instance: {}", info.instance_id());
    println!(
        "Platform: {} {}",
        info.identity.platform.name, info.identity.platform.arch
    );
    println!("Version:  {}", info.app_version);
    for host in &info.host_info_list {
        println!(
            "Host:     {}:{} (/{})",
            host.host_address, info.port, host.network_prefix_length
        );
    }
    println!("Token:    {}", decoded.token);
    println!();
    println!("{}", serde_json::to_string_pretty(info)?);
    Ok(())
}
