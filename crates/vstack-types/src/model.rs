// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration and state models for the resources the reconciler manages.
//!
//! Configuration types describe what an operator declared and are parsed from
//! TOML; state types describe what was last observed on the platform and are
//! persisted between runs by the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    Action, NicImportId, PortId, SectorSize, SectorSizeSpec, VmId, VmStatus,
};

/// A declared virtual machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub cpus: i64,

    /// RAM in megabytes.
    pub ram: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_priority: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_media: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_class: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<i64>,

    pub os_profile: String,

    pub vdc_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_selector: Option<String>,

    /// A transient directive to start or stop the VM.
    #[serde(
        default,
        deserialize_with = "action_or_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<Action>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,

    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

/// A declared disk, keyed by slot within its VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub slot: i64,

    /// Size in gigabytes.
    pub size: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbps_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<SectorSizeSpec>,
}

impl DiskConfig {
    /// The sector size this disk will be created with.
    pub fn resolved_sector_size(&self) -> SectorSize {
        self.sector_size.unwrap_or_default().resolve()
    }

    /// Fills in any unset half of the sector size with the default.
    pub fn apply_default_sector_size(&mut self) {
        self.sector_size = Some(self.resolved_sector_size().into());
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }
}

/// Guest customization inputs. The platform consumes these at creation time
/// and never echoes them back.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boot_cmds: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_cmds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, UserConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password_auth: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_server: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The last observed state of a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    pub id: VmId,
    pub name: String,
    pub description: Option<String>,
    pub cpus: i64,

    /// RAM in megabytes.
    pub ram: i64,
    pub cpu_priority: i64,
    pub boot_media: i64,
    pub vcpu_class: i64,
    pub os_type: i64,
    pub os_profile: String,
    pub vdc_id: i64,
    pub pool_selector: String,

    /// The action matching the observed operational status, if any.
    pub action: Option<Action>,

    pub status: i64,
    pub admin_status: i64,
    pub oper_status: i64,
    pub node: i64,
    pub uefi: String,
    pub create_completed: i64,
    pub locked: i64,
    pub root_dataset: String,
    pub root_dataset_name: String,

    pub guest: Option<GuestState>,

    #[serde(default)]
    pub disks: Vec<DiskState>,
}

impl VmState {
    /// A state that knows only the VM's identifier, as produced by an import.
    /// The next read populates everything else.
    pub fn seed(id: VmId) -> Self {
        Self {
            id,
            name: String::new(),
            description: None,
            cpus: 0,
            ram: 0,
            cpu_priority: 0,
            boot_media: 0,
            vcpu_class: 0,
            os_type: 0,
            os_profile: String::new(),
            vdc_id: 0,
            pool_selector: String::new(),
            action: None,
            status: 0,
            admin_status: 0,
            oper_status: 0,
            node: 0,
            uefi: String::new(),
            create_completed: 0,
            locked: 0,
            root_dataset: String::new(),
            root_dataset_name: String::new(),
            guest: None,
            disks: Vec::new(),
        }
    }

    pub fn oper_status(&self) -> Option<VmStatus> {
        VmStatus::from_code(self.oper_status)
    }

    pub fn is_running(&self) -> bool {
        self.oper_status().is_some_and(VmStatus::is_running)
    }

    pub fn guest_config(&self) -> Option<&GuestConfig> {
        self.guest.as_ref().map(|g| &g.customization)
    }
}

/// Guest customization inputs carried forward from configuration, plus the
/// telemetry the platform reports about the running guest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestState {
    #[serde(default)]
    pub customization: GuestConfig,
    pub ram_used: Option<i64>,
    pub ram_balloon_performed: Option<i64>,
    pub ram_balloon_requested: Option<i64>,
}

/// The last observed state of a disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    pub guid: String,
    pub slot: i64,

    /// Size in gigabytes.
    pub size: i64,
    pub iops_limit: Option<i64>,
    pub mbps_limit: Option<i64>,
    pub label: String,

    /// `None` when the platform did not report a sector size for this disk.
    pub sector_size: Option<SectorSize>,
}

/// A declared network port attached to a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicConfig {
    pub vm_id: VmId,
    pub network_id: i64,
    pub slot: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratelimit_mbits: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_guard: Option<i64>,
}

/// The last observed state of a network port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicState {
    pub id: PortId,
    pub vm_id: VmId,
    pub network_id: i64,
    pub slot: i64,
    pub address: String,
    pub mac: String,
    pub ratelimit_mbits: Option<i64>,
    pub ip_guard: i64,
}

impl NicState {
    /// A state that knows only where the port lives, as produced by an
    /// import.
    pub fn seed(id: NicImportId) -> Self {
        Self {
            id: id.port_id,
            vm_id: id.vm_id,
            network_id: 0,
            slot: 0,
            address: String::new(),
            mac: String::new(),
            ratelimit_mbits: None,
            ip_guard: 0,
        }
    }
}

// An empty action string means "no action", which lets declarations carry
// `action = ""` the same way they would omit the field.
fn action_or_empty<'d, D>(deserializer: D) -> Result<Option<Action>, D::Error>
where
    D: Deserializer<'d>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn action_accepts_empty_and_mixed_case() {
        let cfg: VmConfig = serde_json::from_str(
            r#"{"name":"a","cpus":1,"ram":512,"os_profile":"p","vdc_id":1,
                "action":""}"#,
        )
        .unwrap();
        assert_eq!(cfg.action, None);

        let cfg: VmConfig = serde_json::from_str(
            r#"{"name":"a","cpus":1,"ram":512,"os_profile":"p","vdc_id":1,
                "action":"Start"}"#,
        )
        .unwrap();
        assert_eq!(cfg.action, Some(Action::Start));

        let res: Result<VmConfig, _> = serde_json::from_str(
            r#"{"name":"a","cpus":1,"ram":512,"os_profile":"p","vdc_id":1,
                "action":"pause"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn disk_default_sector_size_keeps_explicit_halves() {
        let mut disk = DiskConfig {
            slot: 1,
            size: 10,
            sector_size: Some(SectorSizeSpec {
                logical: Some(4096),
                physical: None,
            }),
            ..Default::default()
        };
        disk.apply_default_sector_size();
        assert_eq!(
            disk.sector_size,
            Some(SectorSizeSpec { logical: Some(4096), physical: Some(4096) })
        );

        let mut bare = DiskConfig { slot: 2, size: 1, ..Default::default() };
        bare.apply_default_sector_size();
        assert_eq!(bare.resolved_sector_size(), SectorSize::DEFAULT);
    }

    #[test]
    fn seeded_state_is_not_running() {
        let state = VmState::seed(VmId::new(9).unwrap());
        assert_eq!(state.id.get(), 9);
        assert!(!state.is_running());
        assert_eq!(state.oper_status(), None);
    }
}
