// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response shapes for the remote methods of the vStack API.
//!
//! Every remote method is represented by an uninhabited marker type which
//! implements [`RpcMethod`], tying the method's wire name to its parameter
//! and result-data types.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use vstack_types::{Action, PortId, SectorSize, VmId};

/// A remote method: its wire name, parameters and the shape of the `data`
/// carried by a successful result.
pub trait RpcMethod {
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned + Send + Sync;
    type Data: Serialize + DeserializeOwned + Send;
}

macro_rules! rpc_method {
    ($(#[$attr:meta])* $marker:ident, $name:expr, $params:ty, $data:ty) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug)]
        pub enum $marker {}

        impl RpcMethod for $marker {
            const NAME: &'static str = $name;
            type Params = $params;
            type Data = $data;
        }
    };
}

rpc_method!(
    /// Opens a session.
    Auth, "auth", AuthParams, AuthData
);
rpc_method!(
    /// Describes a VM.
    VmGet, "vm-get", VmIdParams, VmDescription
);
rpc_method!(VmsCreate, "vms-create", CreateVmParams, VmCreated);
rpc_method!(
    /// Patches the mutable top-level fields of a VM.
    VmSet, "vm-set", VmSetParams, MessageData
);
rpc_method!(
    VmsRestart,
    Action::Start.method(),
    VmIdParams,
    StartStopData
);
rpc_method!(VmsStop, Action::Stop.method(), VmIdParams, StartStopData);
rpc_method!(VmsAddDisk, "vms-add-disk", AddDiskParams, DiskDescription);
rpc_method!(VmsDiskResize, "vms-disk-resize", ResizeDiskParams, MessageData);
rpc_method!(VmRemoveDisk, "vm-remove-disk", RemoveDiskParams, MessageData);
rpc_method!(
    VmRatelimitDisk,
    "vm-ratelimit-disk",
    RatelimitDiskParams,
    MessageData
);
rpc_method!(
    VmDiskSetLabel,
    "vm-disk-set-label",
    DiskLabelParams,
    MessageData
);
rpc_method!(VmsAddNic, "vms-add-nic", AddNicParams, PortDescription);
rpc_method!(VmRemoveNic, "vm-remove-nic", RemoveNicParams, MessageData);
rpc_method!(
    VmRatelimitNic,
    "vm-ratelimit-nic",
    RatelimitNicParams,
    MessageData
);
rpc_method!(VmsRemove, "vms-remove", RemoveVmParams, MessageData);
rpc_method!(
    /// Lists the OS type to profile catalog.
    VmProfiles, "vm-profiles", NoParams, BTreeMap<String, OsTypeDescription>
);

/// The result status code. The platform encodes it either as an integer or
/// as the decimal string form of one; both decode to the same value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusCode(pub i64);

impl StatusCode {
    pub const SUCCESS: Self = Self(1);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for StatusCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CodeVisitor;

        impl Visitor<'_> for CodeVisitor {
            type Value = StatusCode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an integer status code or its string form")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(StatusCode(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v).map(StatusCode).map_err(|_| {
                    E::invalid_value(de::Unexpected::Unsigned(v), &self)
                })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.trim().parse::<i64>().map(StatusCode).map_err(|_| {
                    E::invalid_value(de::Unexpected::Str(v), &self)
                })
            }
        }

        deserializer.deserialize_any(CodeVisitor)
    }
}

/// The `result` member of a response: a status code plus method-specific
/// data, kept raw until the code has been checked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultBody {
    pub code: StatusCode,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    #[serde(default)]
    pub cookie: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmIdParams {
    pub id: VmId,
}

/// Data carried by results which only report a message, if anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result data shared by the start and stop operations.
pub type StartStopData = MessageData;

/// A VM as described by `vm-get`. Fields are optional so that a description
/// missing a required field can be rejected with a precise error rather than
/// failing to decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmDescription {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub cpus: Option<i64>,
    /// RAM in bytes.
    pub ram: Option<i64>,
    pub cpu_priority: Option<i64>,
    pub boot_media_id: Option<i64>,
    pub vcpu_class: Option<i64>,
    pub os_type: Option<i64>,
    pub os_profile: Option<String>,
    pub vdc: Option<i64>,
    pub pool: Option<String>,
    pub status: Option<i64>,
    pub admin_status: Option<i64>,
    pub oper_status: Option<i64>,
    pub oper_status_ts: Option<i64>,
    pub node: Option<i64>,
    pub uefi: Option<String>,
    pub create_completed: Option<i64>,
    pub created: Option<i64>,
    pub modified: Option<i64>,
    pub locked: Option<i64>,
    pub incarnation: Option<i64>,
    pub hw_version: Option<i64>,
    pub hv_faults: Option<i64>,
    pub rstart: Option<i64>,
    pub gc_id: Option<i64>,
    pub gc_name: Option<String>,
    pub ndmp_address: Option<String>,
    pub root_dataset: Option<serde_json::Value>,
    pub root_dataset_name: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskDescription>,
    #[serde(default)]
    pub network_ports: Vec<PortDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestTelemetry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescription {
    pub guid: Option<String>,
    /// Size in bytes.
    pub size: Option<i64>,
    pub slot: Option<i64>,
    #[serde(default)]
    pub iops_limit: Option<i64>,
    #[serde(default)]
    pub mbps_limit: Option<i64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<SectorSize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub port_id: i64,
    pub network_id: i64,
    pub slot: i64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip_guard: i64,
    #[serde(default)]
    pub ratelimit_mbits: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTelemetry {
    pub ram_used: Option<i64>,
    pub ram_balloon_performed: Option<i64>,
    pub ram_balloon_requested: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmParams {
    pub name: String,
    pub cpus: i64,
    /// RAM in bytes.
    pub ram: i64,
    pub boot_media: i64,
    pub vcpu_class: i64,
    pub os_type: i64,
    pub os_profile: String,
    pub vdc_id: i64,
    pub pool_selector: String,
    pub disks: Vec<CreateDiskParams>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestParams>,
    pub cpu_priority: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDiskParams {
    /// Size in bytes.
    pub size: i64,
    pub slot: i64,
    pub iops_limit: i64,
    pub mbps_limit: i64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<SectorSize>,
}

/// Guest customization as sent on creation. Empty members are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boot_cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password_auth: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverParams>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, UserParams>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_server: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserParams {
    #[serde(
        default,
        rename = "ssh-authorized-keys",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCreated {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSetParams {
    pub id: VmId,
    pub vm_params: VmPatch,
}

/// The changed mutable fields of a VM. Unchanged fields are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<i64>,
    /// RAM in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<i64>,
}

impl VmPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDiskParams {
    pub vm_id: VmId,
    /// Size in bytes.
    pub size: i64,
    pub slot: i64,
    pub label: String,
    pub sector_size: SectorSize,
    pub iops_limit: i64,
    pub mbps_limit: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeDiskParams {
    /// The VM the disk belongs to.
    pub id: VmId,
    pub disk_guid: String,
    /// New size in bytes.
    pub size: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDiskParams {
    pub vm_id: VmId,
    pub disk_guid: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitDiskParams {
    pub vm_id: VmId,
    pub disk_guid: String,
    pub mbps_limit: i64,
    pub iops_limit: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLabelParams {
    pub vm_id: VmId,
    pub guid: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNicParams {
    /// The VM the port is added to.
    pub id: VmId,
    pub network_id: i64,
    pub slot: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratelimit_mbits: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_guard: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNicParams {
    pub vm_id: VmId,
    pub port_id: PortId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitNicParams {
    pub vm_id: VmId,
    pub port_id: PortId,
    pub ratelimit_mbits: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveVmParams {
    pub id: VmId,
    pub vdc_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsTypeDescription {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub profiles: Vec<ProfileDescription>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDescription {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub min_size: i64,
}
