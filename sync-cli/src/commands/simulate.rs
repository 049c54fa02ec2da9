//! Run the engine against a fleet of simulated peers.
//!
//! Devices are given roles round-robin so every connect state shows up:
//! trusted, older version, never trusted, paired by invitation, and
//! unreachable. After the fleet settles, one paste is pulled from the
//! first trusted device with a chunk that fails once.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{
    ChunkTransferEngine, ConsumerCall, EngineConfig, MemoryIdentityStore, MemoryPasteConsumer,
    MemoryRuntimeStore, MemoryTaskStore, MockPeer, PullFileItem, PullFileTask, Resolver,
    SyncOrchestrator, TaskOutcome,
};
use sync_core::{FilesIndex, IndexedFile, PairingToken, SyncInfoPayload};
use sync_types::{
    ConnectState, DeviceIdentity, HostInfo, InstanceId, PasteId, SyncInfo, SyncRuntimeInfo,
    TaskId, TaskType, VersionRelation,
};
use tracing::{info, warn};

use crate::config::local_platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Trusted,
    Older,
    Untrusted,
    Invited,
    Offline,
}

impl Role {
    fn for_index(i: usize) -> Self {
        match i % 5 {
            0 => Self::Trusted,
            1 => Self::Older,
            2 => Self::Untrusted,
            3 => Self::Invited,
            _ => Self::Offline,
        }
    }
}

/// One row of the final state table.
#[derive(Debug, Clone)]
pub struct DeviceRow {
    /// Device name.
    pub name: String,
    /// Instance id.
    pub instance_id: InstanceId,
    /// Settled connect state.
    pub state: ConnectState,
    /// Bound host, if any.
    pub host: Option<String>,
}

/// What a simulation observed.
#[derive(Debug, Clone)]
pub struct Report {
    /// Device states after settling, sorted by name.
    pub devices: Vec<DeviceRow>,
    /// Outcome of the last pull attempt, if a pull ran.
    pub pull: Option<TaskOutcome>,
    /// Pull attempts used.
    pub attempts: u32,
    /// Files handed to the consumer.
    pub delivered: usize,
}

fn device_info(index: usize, host: &str) -> SyncInfo {
    let id = format!("sim-{:02}", index);
    SyncInfo {
        identity: DeviceIdentity {
            instance_id: InstanceId::new(id.clone()),
            device_id: format!("hw-{}", id),
            device_name: format!("Device {}", index),
            platform: local_platform(),
        },
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        host_info_list: vec![HostInfo::new("169.254.0.1", 16), HostInfo::new(host, 24)],
        port: 13129,
    }
}

/// Build the fleet, let it settle for `settle`, pull one paste.
pub async fn simulate(
    data_dir: &Path,
    devices: usize,
    settle: Duration,
    config: EngineConfig,
) -> Result<Report> {
    let peer = MockPeer::new();
    let identities = Arc::new(MemoryIdentityStore::new());
    let mut seeded = Vec::new();
    let mut invitations = Vec::new();

    for index in 0..devices {
        let host = format!("10.0.0.{}", index + 2);
        let info = device_info(index, &host);
        let id = info.instance_id().clone();
        match Role::for_index(index) {
            Role::Trusted => {
                peer.set_reachable(&id, &[&host], VersionRelation::EqualTo);
                identities.cache_public_key(&id);
            }
            Role::Older => {
                peer.set_reachable(&id, &[&host], VersionRelation::Older);
                identities.cache_public_key(&id);
            }
            Role::Untrusted => peer.set_reachable(&id, &[&host], VersionRelation::EqualTo),
            Role::Invited => {
                peer.set_reachable(&id, &[&host], VersionRelation::EqualTo);
                let token = PairingToken::generate()?;
                peer.accept_token(&id, token);
                invitations.push(SyncInfoPayload::new(info, token).encode()?);
                continue;
            }
            Role::Offline => peer.set_unreachable(&id),
        }
        seeded.push(SyncRuntimeInfo::from_sync_info(info, sync_client::now_millis()));
    }

    let store = Arc::new(MemoryRuntimeStore::with_records(seeded));
    let resolver = Resolver::new(
        store,
        identities,
        Arc::new(peer.clone()),
        Arc::new(peer.clone()),
    );
    let pull_config = config.pull.clone();
    let orchestrator = SyncOrchestrator::start(resolver, config);

    // Invitations travel as encoded payloads, like a scanned QR code
    for payload in &invitations {
        let decoded = SyncInfoPayload::decode(payload)?;
        info!("pairing with {}", decoded.sync_info.instance_id());
        orchestrator.pair(decoded);
    }

    tokio::time::sleep(settle).await;

    let mut pull = None;
    let mut attempts = 0;
    let consumer = Arc::new(MemoryPasteConsumer::new());
    if devices > 0 {
        let remote = device_info(0, "10.0.0.2").instance_id().clone();
        let chunk_size = pull_config.chunk_size.max(1);
        let files = vec![
            PullFileItem::new("report.pdf", chunk_size * 2 + chunk_size / 2),
            PullFileItem::new("empty.txt", 0),
            PullFileItem::new("notes/report.pdf", chunk_size / 3 + 1),
        ];
        let index = FilesIndex::build(
            files
                .iter()
                .map(|f| IndexedFile::new(f.name.clone(), f.size))
                .collect(),
            chunk_size,
        );
        peer.serve_chunks(
            &remote,
            index
                .chunks()
                .iter()
                .map(|chunk| vec![chunk.index as u8; chunk.len as usize])
                .collect(),
        );
        if index.chunk_count() > 1 {
            peer.fail_chunk_once(&remote, 1);
        }

        let engine = ChunkTransferEngine::new(
            orchestrator.clone(),
            Arc::new(peer.clone()),
            Arc::new(MemoryTaskStore::new()),
            consumer.clone(),
            data_dir.join("pastes"),
            &pull_config,
        );
        let task = PullFileTask {
            task_id: TaskId::new(),
            paste_id: PasteId::new(1),
            remote,
            files,
        };

        for attempt in 1..=TaskType::PullFile.max_attempts() {
            attempts = attempt;
            let outcome = engine.execute(&task, attempt).await;
            match &outcome {
                TaskOutcome::NeedsRetry { message } => {
                    warn!("pull attempt {} failed: {}", attempt, message);
                    pull = Some(outcome);
                }
                _ => {
                    pull = Some(outcome);
                    break;
                }
            }
        }
    }

    let mut rows: Vec<DeviceRow> = orchestrator
        .records()
        .await
        .into_iter()
        .map(|record| DeviceRow {
            name: record.identity.device_name.clone(),
            instance_id: record.instance_id().clone(),
            state: record.connect_state,
            host: record.connect_host_address.clone(),
        })
        .collect();
    rows.sort_by(|a, b| a.instance_id.as_str().cmp(b.instance_id.as_str()));

    let delivered = consumer
        .calls()
        .iter()
        .map(|call| match call {
            ConsumerCall::Delivered(_, paths) => paths.len(),
            _ => 0,
        })
        .sum();

    orchestrator.notify_exit().await;
    orchestrator.shutdown();

    Ok(Report {
        devices: rows,
        pull,
        attempts,
        delivered,
    })
}

/// Run the simulate command.
pub async fn run(data_dir: &Path, devices: usize, seconds: u64, config: EngineConfig) -> Result<()> {
    let report = simulate(data_dir, devices, Duration::from_secs(seconds), config)
        .await
        .context("Simulation failed")?;

    println!("{:<12} {:<10} {:<14} HOST", "DEVICE", "ID", "STATE");
    for row in &report.devices {
        println!(
            "{:<12} {:<10} {:<14} {}",
            row.name,
            row.instance_id,
            row.state,
            row.host.as_deref().unwrap_or("-")
        );
    }

    println!();
    match &report.pull {
        Some(TaskOutcome::Success) => println!(
            "Pull: delivered {} file(s) after {} attempt(s)",
            report.delivered, report.attempts
        ),
        Some(outcome) => println!("Pull: {:?} after {} attempt(s)", outcome, report.attempts),
        None => println!("Pull: skipped (no devices)"),
    }
    Ok(())
}
