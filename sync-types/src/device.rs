//! What discovery reports about a peer.

use serde::{Deserialize, Serialize};

use crate::InstanceId;

/// Operating system and architecture of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// OS family ("Macos", "Windows", "Linux").
    pub name: String,
    /// CPU architecture ("x86_64", "aarch64").
    pub arch: String,
    /// Pointer width in bits.
    pub bit_mode: u8,
    /// OS version string.
    pub version: String,
}

/// Immutable identity of one installed app instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable per-install identifier.
    pub instance_id: InstanceId,
    /// Hardware identifier.
    pub device_id: String,
    /// Display label chosen by the peer.
    pub device_name: String,
    /// Platform descriptor.
    pub platform: Platform,
}

/// One candidate address a peer can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// IPv4/IPv6 address.
    pub host_address: String,
    /// Network prefix length of the interface the address belongs to.
    pub network_prefix_length: u16,
}

impl HostInfo {
    /// Create a host candidate.
    pub fn new(host_address: impl Into<String>, network_prefix_length: u16) -> Self {
        Self {
            host_address: host_address.into(),
            network_prefix_length,
        }
    }
}

/// Identity plus reachability, as announced by discovery or carried in a
/// pairing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Who the peer is.
    pub identity: DeviceIdentity,
    /// App/protocol version of the peer.
    pub app_version: String,
    /// Candidate addresses, in the order discovery reported them.
    pub host_info_list: Vec<HostInfo>,
    /// Port the peer's sync server listens on.
    pub port: u16,
}

impl SyncInfo {
    /// The instance id of the announced peer.
    pub fn instance_id(&self) -> &InstanceId {
        &self.identity.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_info_uses_camel_case_json() {
        let info = SyncInfo {
            identity: DeviceIdentity {
                instance_id: InstanceId::new("a1"),
                device_id: "dev".into(),
                device_name: "Laptop".into(),
                platform: Platform {
                    name: "Linux".into(),
                    arch: "x86_64".into(),
                    bit_mode: 64,
                    version: "6.1".into(),
                },
            },
            app_version: "1.2.0".into(),
            host_info_list: vec![HostInfo::new("192.168.1.10", 24)],
            port: 13129,
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"instanceId\":\"a1\""));
        assert!(json.contains("\"hostInfoList\""));
        assert!(json.contains("\"networkPrefixLength\":24"));

        let back: SyncInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.instance_id().as_str(), "a1");
    }
}
