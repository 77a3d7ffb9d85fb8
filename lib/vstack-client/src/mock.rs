// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for the vStack platform, for use in tests.
//!
//! [`MockVstack`] implements [`RpcTransport`] by applying each request to a
//! small model of the platform. It records every call it receives so tests
//! can assert on the sequence of remote operations, and failures can be
//! injected per method.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::{self, RpcMethod};
use crate::{Error, RequestEnvelope, ResponseEnvelope, RpcError, RpcTransport};
use vstack_types::{Action, SectorSize, VmId, VmStatus};

/// A failure to inject into the next call of a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A result whose status code is not success.
    Domain { code: i64, message: String },
    /// An envelope-level error object.
    Envelope { code: i64, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
}

enum Fault {
    Refused(i64, String),
    Invalid(String),
}

type Outcome = Result<Option<Value>, Fault>;

#[derive(Default)]
struct Platform {
    vms: BTreeMap<i64, api::VmDescription>,
    profiles: BTreeMap<String, api::OsTypeDescription>,
    next_vm: i64,
    next_port: i64,
    next_disk: u64,
    calls: Vec<RecordedCall>,
    failures: BTreeMap<String, VecDeque<Failure>>,
}

/// The mock platform. See the module documentation.
#[derive(Default)]
pub struct MockVstack {
    inner: Mutex<Platform>,
}

/// A VM description with every required field populated, as the platform
/// reports a stopped VM with no disks or ports.
pub fn vm_template(id: i64, name: &str) -> api::VmDescription {
    api::VmDescription {
        id: Some(id),
        name: Some(name.to_string()),
        description: None,
        cpus: Some(1),
        ram: Some(vstack_types::mb_to_bytes(1024)),
        cpu_priority: Some(1),
        boot_media_id: Some(0),
        vcpu_class: Some(0),
        os_type: Some(1),
        os_profile: Some("default".to_string()),
        vdc: Some(1),
        pool: Some(String::new()),
        status: Some(1),
        admin_status: Some(1),
        oper_status: Some(VmStatus::Offline.code()),
        oper_status_ts: Some(0),
        node: Some(1),
        uefi: Some(String::new()),
        create_completed: Some(1),
        created: Some(0),
        modified: Some(0),
        locked: Some(0),
        incarnation: Some(1),
        hw_version: Some(1),
        hv_faults: Some(0),
        rstart: Some(0),
        gc_id: Some(0),
        gc_name: Some(String::new()),
        ndmp_address: Some(String::new()),
        root_dataset: Some(json!(id)),
        root_dataset_name: Some(format!("pool/vm-{id}")),
        disks: Vec::new(),
        network_ports: Vec::new(),
        guest: Some(api::GuestTelemetry {
            ram_used: Some(0),
            ram_balloon_performed: Some(0),
            ram_balloon_requested: Some(0),
        }),
    }
}

impl MockVstack {
    /// Result code for operations on unknown VMs, disks or ports.
    pub const NOT_FOUND: i64 = 404;
    /// Result code for operations the platform refuses in the VM's current
    /// state.
    pub const REFUSED: i64 = 409;

    pub fn new() -> Self {
        Self::default()
    }

    fn platform(&self) -> MutexGuard<'_, Platform> {
        // A panic while holding the lock already failed the test.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a VM described by `desc`, assigning an id if it has none.
    pub fn insert_vm(&self, mut desc: api::VmDescription) -> VmId {
        let mut p = self.platform();
        let id = match desc.id {
            Some(id) if id > 0 => id,
            _ => {
                p.next_vm += 1;
                p.next_vm
            }
        };
        p.next_vm = p.next_vm.max(id);
        desc.id = Some(id);
        p.vms.insert(id, desc);
        VmId::new(id).unwrap_or_else(|_| unreachable!("ids are positive"))
    }

    pub fn vm(&self, id: VmId) -> Option<api::VmDescription> {
        self.platform().vms.get(&id.get()).cloned()
    }

    /// Replaces a VM's description wholesale, e.g. to simulate drift.
    pub fn update_vm(&self, id: VmId, f: impl FnOnce(&mut api::VmDescription)) {
        if let Some(vm) = self.platform().vms.get_mut(&id.get()) {
            f(vm);
        }
    }

    pub fn set_oper_status(&self, id: VmId, status: VmStatus) {
        self.update_vm(id, |vm| vm.oper_status = Some(status.code()));
    }

    pub fn set_profiles(&self, profiles: BTreeMap<String, api::OsTypeDescription>) {
        self.platform().profiles = profiles;
    }

    /// Makes the next call of `method` fail. Injected failures are consumed
    /// in the order they were queued.
    pub fn fail_next(&self, method: &str, failure: Failure) {
        self.platform()
            .failures
            .entry(method.to_string())
            .or_default()
            .push_back(failure);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.platform().calls.clone()
    }

    /// Names of the methods called so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.platform().calls.iter().map(|c| c.method.clone()).collect()
    }

    /// Names of the methods called so far, leaving out `vm-get`.
    pub fn mutating_methods(&self) -> Vec<String> {
        self.methods()
            .into_iter()
            .filter(|m| m != api::VmGet::NAME)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.platform().calls.clear();
    }
}

fn params<M: RpcMethod>(raw: Value) -> Result<M::Params, Fault> {
    serde_json::from_value(raw).map_err(|e| {
        Fault::Invalid(format!("invalid params for {}: {e}", M::NAME))
    })
}

fn data<T: serde::Serialize>(value: &T) -> Outcome {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| Fault::Invalid(e.to_string()))
}

fn not_found(what: &str) -> Fault {
    Fault::Refused(MockVstack::NOT_FOUND, format!("{what} not found"))
}

fn message(text: &str) -> Outcome {
    data(&api::MessageData { message: Some(text.to_string()) })
}

impl Platform {
    fn vm_mut(&mut self, id: VmId) -> Result<&mut api::VmDescription, Fault> {
        self.vms.get_mut(&id.get()).ok_or_else(|| not_found("VM"))
    }

    fn running_vm(
        &mut self,
        id: VmId,
        refusal: &str,
    ) -> Result<&mut api::VmDescription, Fault> {
        let vm = self.vm_mut(id)?;
        if vm.oper_status == Some(VmStatus::Started.code()) {
            return Err(Fault::Refused(MockVstack::REFUSED, refusal.to_string()));
        }
        Ok(vm)
    }

    fn dispatch(&mut self, method: &str, raw: Value) -> Outcome {
        match method {
            api::Auth::NAME => {
                params::<api::Auth>(raw)?;
                data(&json!({"cookie": {"APIEndpoint00": "mock-session"}}))
            }
            api::VmGet::NAME => {
                let p = params::<api::VmGet>(raw)?;
                let vm = self.vm_mut(p.id)?;
                data(&*vm)
            }
            api::VmsCreate::NAME => self.create(params::<api::VmsCreate>(raw)?),
            api::VmSet::NAME => {
                let p = params::<api::VmSet>(raw)?;
                let vm = self.vm_mut(p.id)?;
                let patch = p.vm_params;
                if let Some(name) = patch.name {
                    vm.name = Some(name);
                }
                if let Some(description) = patch.description {
                    vm.description = Some(description);
                }
                if let Some(cpus) = patch.cpus {
                    vm.cpus = Some(cpus);
                }
                if let Some(ram) = patch.ram {
                    vm.ram = Some(ram);
                }
                message("updated")
            }
            api::VmsRestart::NAME => {
                let p = params::<api::VmsRestart>(raw)?;
                let vm = self.vm_mut(p.id)?;
                vm.oper_status = Some(Action::Start.target_status().code());
                message("started")
            }
            api::VmsStop::NAME => {
                let p = params::<api::VmsStop>(raw)?;
                let vm = self.vm_mut(p.id)?;
                if vm.oper_status == Some(VmStatus::Created.code()) {
                    return Err(Fault::Refused(
                        MockVstack::REFUSED,
                        "VM has never been started".to_string(),
                    ));
                }
                vm.oper_status = Some(Action::Stop.target_status().code());
                message("stopped")
            }
            api::VmsAddDisk::NAME => {
                let p = params::<api::VmsAddDisk>(raw)?;
                self.next_disk += 1;
                let guid = format!("disk-{:04}", self.next_disk);
                let vm = self.vm_mut(p.vm_id)?;
                if vm.disks.iter().any(|d| d.slot == Some(p.slot)) {
                    return Err(Fault::Refused(
                        MockVstack::REFUSED,
                        format!("slot {} is in use", p.slot),
                    ));
                }
                let disk = api::DiskDescription {
                    guid: Some(guid),
                    size: Some(p.size),
                    slot: Some(p.slot),
                    iops_limit: Some(p.iops_limit),
                    mbps_limit: Some(p.mbps_limit),
                    label: Some(p.label),
                    sector_size: Some(p.sector_size),
                };
                vm.disks.push(disk.clone());
                data(&disk)
            }
            api::VmsDiskResize::NAME => {
                let p = params::<api::VmsDiskResize>(raw)?;
                let disk = find_disk(self.vm_mut(p.id)?, &p.disk_guid)?;
                if p.size < disk.size.unwrap_or(0) {
                    return Err(Fault::Refused(
                        MockVstack::REFUSED,
                        "disks cannot shrink".to_string(),
                    ));
                }
                disk.size = Some(p.size);
                message("resized")
            }
            api::VmRemoveDisk::NAME => {
                let p = params::<api::VmRemoveDisk>(raw)?;
                let vm = self
                    .running_vm(p.vm_id, "cannot remove a disk while started")?;
                let before = vm.disks.len();
                vm.disks.retain(|d| d.guid.as_deref() != Some(&p.disk_guid));
                if vm.disks.len() == before {
                    return Err(not_found("disk"));
                }
                message("removed")
            }
            api::VmRatelimitDisk::NAME => {
                let p = params::<api::VmRatelimitDisk>(raw)?;
                let disk = find_disk(self.vm_mut(p.vm_id)?, &p.disk_guid)?;
                disk.iops_limit = Some(p.iops_limit);
                disk.mbps_limit = Some(p.mbps_limit);
                message("ratelimited")
            }
            api::VmDiskSetLabel::NAME => {
                let p = params::<api::VmDiskSetLabel>(raw)?;
                let disk = find_disk(self.vm_mut(p.vm_id)?, &p.guid)?;
                disk.label = Some(p.label);
                message("labeled")
            }
            api::VmsAddNic::NAME => {
                let p = params::<api::VmsAddNic>(raw)?;
                self.next_port += 1;
                let port_id = self.next_port;
                let vm =
                    self.running_vm(p.id, "cannot add a port while started")?;
                let port = api::PortDescription {
                    port_id,
                    network_id: p.network_id,
                    slot: p.slot,
                    address: p
                        .address
                        .unwrap_or_else(|| format!("10.0.0.{port_id}")),
                    mac: format!("02:00:00:00:00:{:02x}", port_id & 0xff),
                    ip_guard: p.ip_guard.unwrap_or(0),
                    ratelimit_mbits: p.ratelimit_mbits,
                };
                vm.network_ports.push(port.clone());
                data(&port)
            }
            api::VmRemoveNic::NAME => {
                let p = params::<api::VmRemoveNic>(raw)?;
                let vm = self
                    .running_vm(p.vm_id, "cannot remove a port while started")?;
                let before = vm.network_ports.len();
                vm.network_ports.retain(|n| n.port_id != p.port_id.get());
                if vm.network_ports.len() == before {
                    return Err(not_found("port"));
                }
                message("removed")
            }
            api::VmRatelimitNic::NAME => {
                let p = params::<api::VmRatelimitNic>(raw)?;
                let vm = self.vm_mut(p.vm_id)?;
                let port = vm
                    .network_ports
                    .iter_mut()
                    .find(|n| n.port_id == p.port_id.get())
                    .ok_or_else(|| not_found("port"))?;
                // A zero limit lifts the limit.
                port.ratelimit_mbits =
                    Some(p.ratelimit_mbits).filter(|&r| r != 0);
                message("ratelimited")
            }
            api::VmsRemove::NAME => {
                let p = params::<api::VmsRemove>(raw)?;
                let vm = self.vm_mut(p.id)?;
                if vm.vdc != Some(p.vdc_id) {
                    return Err(Fault::Refused(
                        MockVstack::REFUSED,
                        format!("VM is not in VDC {}", p.vdc_id),
                    ));
                }
                self.vms.remove(&p.id.get());
                message("removed")
            }
            api::VmProfiles::NAME => {
                params::<api::VmProfiles>(raw)?;
                data(&self.profiles)
            }
            other => Err(Fault::Invalid(format!("unknown method {other}"))),
        }
    }

    fn create(&mut self, p: api::CreateVmParams) -> Outcome {
        self.next_vm += 1;
        let id = self.next_vm;
        let mut vm = vm_template(id, &p.name);
        vm.description = Some(p.description);
        vm.cpus = Some(p.cpus);
        vm.ram = Some(p.ram);
        vm.cpu_priority = Some(p.cpu_priority);
        vm.boot_media_id = Some(p.boot_media);
        vm.vcpu_class = Some(p.vcpu_class);
        vm.os_type = Some(p.os_type);
        vm.os_profile = Some(p.os_profile);
        vm.vdc = Some(p.vdc_id);
        vm.pool = Some(p.pool_selector);
        vm.oper_status = Some(VmStatus::Created.code());
        for disk in p.disks {
            self.next_disk += 1;
            vm.disks.push(api::DiskDescription {
                guid: Some(format!("disk-{:04}", self.next_disk)),
                size: Some(disk.size),
                slot: Some(disk.slot),
                iops_limit: Some(disk.iops_limit),
                mbps_limit: Some(disk.mbps_limit),
                label: Some(disk.label),
                sector_size: Some(disk.sector_size.unwrap_or(SectorSize::DEFAULT)),
            });
        }
        self.vms.insert(id, vm);
        data(&api::VmCreated { id: Some(id) })
    }
}

fn find_disk<'a>(
    vm: &'a mut api::VmDescription,
    guid: &str,
) -> Result<&'a mut api::DiskDescription, Fault> {
    vm.disks
        .iter_mut()
        .find(|d| d.guid.as_deref() == Some(guid))
        .ok_or_else(|| not_found("disk"))
}

#[async_trait]
impl RpcTransport for MockVstack {
    async fn send(
        &self,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        // Give other tasks a chance to run between calls, so that concurrent
        // callers interleave unless something serializes them.
        tokio::task::yield_now().await;

        let mut platform = self.platform();
        platform.calls.push(RecordedCall {
            method: request.method.clone(),
            params: request.params.clone(),
        });

        let injected = platform
            .failures
            .get_mut(&request.method)
            .and_then(VecDeque::pop_front);
        let outcome = match injected {
            Some(Failure::Domain { code, message }) => {
                Err(Fault::Refused(code, message))
            }
            Some(Failure::Envelope { code, message }) => {
                return Ok(envelope(request, None, Some(RpcError { code, message })));
            }
            None => platform.dispatch(&request.method, request.params.clone()),
        };

        Ok(match outcome {
            Ok(data) => {
                envelope(request, Some(json!({"code": 1, "data": data})), None)
            }
            Err(Fault::Refused(code, message)) => envelope(
                request,
                Some(json!({"code": code, "data": {"message": message}})),
                None,
            ),
            Err(Fault::Invalid(message)) => envelope(
                request,
                None,
                Some(RpcError { code: -32602, message }),
            ),
        })
    }
}

fn envelope(
    request: &RequestEnvelope,
    result: Option<Value>,
    error: Option<RpcError>,
) -> ResponseEnvelope {
    ResponseEnvelope {
        id: request.id.to_string(),
        jsonrpc: request.jsonrpc.clone(),
        error,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;
    use slog::{o, Logger};
    use std::sync::Arc;

    fn client(mock: &Arc<MockVstack>) -> Client {
        Client::new(mock.clone(), Logger::root(slog::Discard, o!()))
    }

    #[tokio::test]
    async fn created_vm_must_start_before_stopping() {
        let mock = Arc::new(MockVstack::new());
        let client = client(&mock);
        let created = client
            .call::<api::VmsCreate>(&api::CreateVmParams {
                name: "a".to_string(),
                cpus: 1,
                ram: vstack_types::mb_to_bytes(512),
                boot_media: 0,
                vcpu_class: 0,
                os_type: 1,
                os_profile: "p".to_string(),
                vdc_id: 2,
                pool_selector: String::new(),
                disks: Vec::new(),
                description: String::new(),
                guest: None,
                cpu_priority: 1,
            })
            .await
            .unwrap();
        let id = VmId::new(created.id.unwrap()).unwrap();

        let err = client
            .run_action(vstack_types::Action::Stop, id)
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), Some(crate::StatusCode(MockVstack::REFUSED)));

        client.run_action(vstack_types::Action::Start, id).await.unwrap();
        client.run_action(vstack_types::Action::Stop, id).await.unwrap();
        let vm = client.vm_get(id).await.unwrap();
        assert_eq!(vm.oper_status, Some(VmStatus::Offline.code()));
        assert_eq!(
            mock.methods(),
            vec!["vms-create", "vms-stop", "vms-restart", "vms-stop", "vm-get"]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let mock = Arc::new(MockVstack::new());
        let id = mock.insert_vm(vm_template(5, "b"));
        mock.fail_next(
            "vm-get",
            Failure::Envelope { code: -1, message: "boom".to_string() },
        );
        let client = client(&mock);

        assert!(matches!(client.vm_get(id).await, Err(Error::Rpc { .. })));
        assert_eq!(client.vm_get(id).await.unwrap().id, Some(5));
    }

    #[tokio::test]
    async fn ports_cannot_change_while_started() {
        let mock = Arc::new(MockVstack::new());
        let id = mock.insert_vm(vm_template(3, "c"));
        mock.set_oper_status(id, VmStatus::Started);
        let client = client(&mock);

        let params = api::AddNicParams {
            id,
            network_id: 1,
            slot: 1,
            ratelimit_mbits: None,
            address: None,
            ip_guard: None,
        };
        assert!(client.call::<api::VmsAddNic>(&params).await.is_err());

        mock.set_oper_status(id, VmStatus::Offline);
        let port = client.call::<api::VmsAddNic>(&params).await.unwrap();
        assert_eq!(port.port_id, 1);
        assert_eq!(port.address, "10.0.0.1");
    }
}
