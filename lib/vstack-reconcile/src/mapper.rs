// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation between the platform's wire shapes and the configuration and
//! state models.

use thiserror::Error;

use vstack_client::api::{
    CreateDiskParams, CreateVmParams, DiskDescription, GuestParams,
    GuestTelemetry, PortDescription, ResolverParams, UserParams,
    VmDescription,
};
use vstack_types::model::{
    DiskConfig, DiskState, GuestConfig, GuestState, NicState, VmConfig,
    VmState,
};
use vstack_types::{
    bytes_to_gb, bytes_to_mb, gb_to_bytes, mb_to_bytes, Action, IdError,
    PortId, VmId,
};

/// CPU priority sent on creation when the configuration leaves it unset.
pub const DEFAULT_CPU_PRIORITY: i64 = 1;

/// Validation failures for a description received from the platform.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("required field {0} is missing")]
    Missing(String),

    #[error("field {field} must be non-negative, got {value}")]
    Negative { field: String, value: i64 },

    #[error("field {field} is not a valid identifier: {source}")]
    Id {
        field: String,
        #[source]
        source: IdError,
    },
}

fn int(value: Option<i64>, field: &str) -> Result<i64, MapError> {
    let value = value.ok_or_else(|| MapError::Missing(field.to_string()))?;
    non_negative(value, field)
}

fn non_negative(value: i64, field: &str) -> Result<i64, MapError> {
    if value < 0 {
        return Err(MapError::Negative { field: field.to_string(), value });
    }
    Ok(value)
}

fn opt_int(value: Option<i64>, field: &str) -> Result<Option<i64>, MapError> {
    value.map(|v| non_negative(v, field)).transpose()
}

fn text(value: &Option<String>, field: &str) -> Result<String, MapError> {
    value.clone().ok_or_else(|| MapError::Missing(field.to_string()))
}

/// Maps a VM description onto state.
///
/// `guest_inputs` supplies the guest customization to carry forward, since
/// the platform never echoes it back; only guest telemetry comes from the
/// description. Any validation failure rejects the whole description.
pub fn to_state(
    desc: &VmDescription,
    guest_inputs: Option<&GuestConfig>,
) -> Result<VmState, MapError> {
    let raw_id = int(desc.id, "id")?;
    let id = VmId::new(raw_id)
        .map_err(|source| MapError::Id { field: "id".to_string(), source })?;

    let oper_status = int(desc.oper_status, "oper_status")?;
    let root_dataset = match &desc.root_dataset {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let disks = desc
        .disks
        .iter()
        .enumerate()
        .map(|(i, d)| disk_to_state(d, i))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VmState {
        id,
        name: text(&desc.name, "name")?,
        description: desc.description.clone(),
        cpus: int(desc.cpus, "cpus")?,
        ram: bytes_to_mb(int(desc.ram, "ram")?),
        cpu_priority: int(desc.cpu_priority, "cpu_priority")?,
        boot_media: int(desc.boot_media_id, "boot_media_id")?,
        vcpu_class: int(desc.vcpu_class, "vcpu_class")?,
        os_type: int(desc.os_type, "os_type")?,
        os_profile: text(&desc.os_profile, "os_profile")?,
        vdc_id: int(desc.vdc, "vdc")?,
        pool_selector: text(&desc.pool, "pool")?,
        action: Action::observed(oper_status),
        status: int(desc.status, "status")?,
        admin_status: int(desc.admin_status, "admin_status")?,
        oper_status,
        node: int(desc.node, "node")?,
        uefi: text(&desc.uefi, "uefi")?,
        create_completed: int(desc.create_completed, "create_completed")?,
        locked: int(desc.locked, "locked")?,
        root_dataset,
        root_dataset_name: text(&desc.root_dataset_name, "root_dataset_name")?,
        guest: guest_state(desc.guest.as_ref(), guest_inputs),
        disks,
    })
}

fn guest_state(
    telemetry: Option<&GuestTelemetry>,
    inputs: Option<&GuestConfig>,
) -> Option<GuestState> {
    match (telemetry, inputs) {
        (None, None) => None,
        (telemetry, inputs) => Some(GuestState {
            customization: inputs.cloned().unwrap_or_default(),
            ram_used: telemetry.and_then(|t| t.ram_used),
            ram_balloon_performed: telemetry
                .and_then(|t| t.ram_balloon_performed),
            ram_balloon_requested: telemetry
                .and_then(|t| t.ram_balloon_requested),
        }),
    }
}

/// Maps one described disk. `index` locates the disk in error messages.
pub fn disk_to_state(
    disk: &DiskDescription,
    index: usize,
) -> Result<DiskState, MapError> {
    let field = |name: &str| format!("disks[{index}].{name}");
    Ok(DiskState {
        guid: text(&disk.guid, &field("guid"))?,
        slot: int(disk.slot, &field("slot"))?,
        size: bytes_to_gb(int(disk.size, &field("size"))?),
        iops_limit: opt_int(disk.iops_limit, &field("iops_limit"))?,
        mbps_limit: opt_int(disk.mbps_limit, &field("mbps_limit"))?,
        label: disk.label.clone().unwrap_or_default(),
        sector_size: disk.sector_size,
    })
}

/// Maps a network port attached to `vm_id`.
pub fn port_to_state(
    vm_id: VmId,
    port: &PortDescription,
) -> Result<NicState, MapError> {
    let id = PortId::new(port.port_id).map_err(|source| MapError::Id {
        field: "port_id".to_string(),
        source,
    })?;
    Ok(NicState {
        id,
        vm_id,
        network_id: non_negative(port.network_id, "network_id")?,
        slot: non_negative(port.slot, "slot")?,
        address: port.address.clone(),
        mac: port.mac.clone(),
        ratelimit_mbits: opt_int(port.ratelimit_mbits, "ratelimit_mbits")?,
        ip_guard: port.ip_guard,
    })
}

/// Renders state back into the shape of a description. Fields the state
/// does not track are left unset.
pub fn to_description(state: &VmState) -> VmDescription {
    VmDescription {
        id: Some(state.id.get()),
        name: Some(state.name.clone()),
        description: state.description.clone(),
        cpus: Some(state.cpus),
        ram: Some(mb_to_bytes(state.ram)),
        cpu_priority: Some(state.cpu_priority),
        boot_media_id: Some(state.boot_media),
        vcpu_class: Some(state.vcpu_class),
        os_type: Some(state.os_type),
        os_profile: Some(state.os_profile.clone()),
        vdc: Some(state.vdc_id),
        pool: Some(state.pool_selector.clone()),
        status: Some(state.status),
        admin_status: Some(state.admin_status),
        oper_status: Some(state.oper_status),
        node: Some(state.node),
        uefi: Some(state.uefi.clone()),
        create_completed: Some(state.create_completed),
        locked: Some(state.locked),
        root_dataset: Some(serde_json::Value::String(
            state.root_dataset.clone(),
        )),
        root_dataset_name: Some(state.root_dataset_name.clone()),
        disks: state
            .disks
            .iter()
            .map(|d| DiskDescription {
                guid: Some(d.guid.clone()),
                size: Some(gb_to_bytes(d.size)),
                slot: Some(d.slot),
                iops_limit: d.iops_limit,
                mbps_limit: d.mbps_limit,
                label: Some(d.label.clone()),
                sector_size: d.sector_size,
            })
            .collect(),
        guest: state.guest.as_ref().map(|g| GuestTelemetry {
            ram_used: g.ram_used,
            ram_balloon_performed: g.ram_balloon_performed,
            ram_balloon_requested: g.ram_balloon_requested,
        }),
        ..Default::default()
    }
}

/// Builds the `vms-create` parameters for `config`. Disks are sent with
/// their resolved sector sizes.
pub fn create_params(config: &VmConfig) -> CreateVmParams {
    CreateVmParams {
        name: config.name.clone(),
        cpus: config.cpus,
        ram: mb_to_bytes(config.ram),
        boot_media: config.boot_media.unwrap_or(0),
        vcpu_class: config.vcpu_class.unwrap_or(0),
        os_type: config.os_type.unwrap_or(0),
        os_profile: config.os_profile.clone(),
        vdc_id: config.vdc_id,
        pool_selector: config.pool_selector.clone().unwrap_or_default(),
        disks: format_disks(&config.disks),
        description: config.description.clone().unwrap_or_default(),
        guest: config.guest.as_ref().and_then(guest_params),
        cpu_priority: config.cpu_priority.unwrap_or(DEFAULT_CPU_PRIORITY),
    }
}

pub fn format_disks(disks: &[DiskConfig]) -> Vec<CreateDiskParams> {
    disks
        .iter()
        .map(|d| CreateDiskParams {
            size: gb_to_bytes(d.size),
            slot: d.slot,
            iops_limit: d.iops_limit.unwrap_or(0),
            mbps_limit: d.mbps_limit.unwrap_or(0),
            label: d.label().to_string(),
            sector_size: Some(d.resolved_sector_size()),
        })
        .collect()
}

fn non_empty(values: &[String]) -> Vec<String> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

fn non_empty_str(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

/// Builds the guest customization payload, leaving out every empty member.
/// Returns `None` when nothing would be sent.
pub fn guest_params(guest: &GuestConfig) -> Option<GuestParams> {
    let resolver = guest
        .resolver
        .as_ref()
        .map(|r| ResolverParams {
            name_server: non_empty(&r.name_server),
            search: non_empty_str(&r.search),
        })
        .filter(|r| *r != ResolverParams::default());

    let users = guest
        .users
        .iter()
        .map(|(name, user)| {
            let params = UserParams {
                ssh_authorized_keys: non_empty(&user.ssh_authorized_keys),
                password: non_empty_str(&user.password),
            };
            (name.clone(), params)
        })
        .filter(|(_, user)| *user != UserParams::default())
        .collect();

    let params = GuestParams {
        hostname: non_empty_str(&guest.hostname),
        boot_cmds: non_empty(&guest.boot_cmds),
        run_cmds: non_empty(&guest.run_cmds),
        ssh_password_auth: guest.ssh_password_auth.filter(|&v| v != 0),
        resolver,
        users,
    };
    (params != GuestParams::default()).then_some(params)
}
