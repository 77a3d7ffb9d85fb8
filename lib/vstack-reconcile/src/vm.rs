// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM lifecycle: create, read, update, delete and import.

use std::str::FromStr;
use std::sync::Arc;

use slog::{info, o, Logger};

use vstack_client::api::{self, RpcMethod};
use vstack_client::Client;
use vstack_types::model::{VmConfig, VmState};
use vstack_types::{mb_to_bytes, Action, VmId, VmStatus};

use crate::disks::{apply_disk_ops, diff_disks, RemovalBracket};
use crate::{describe, mapper, run_action, vm_resource, Error, VmLocks};

/// A declared value that differs from what was observed for a field which
/// cannot change after creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub observed: String,
    pub planned: String,
}

fn changed<T: PartialEq + ToString>(
    field: &'static str,
    planned: Option<&T>,
    observed: &T,
    out: &mut Vec<FieldChange>,
) {
    if let Some(planned) = planned {
        if planned != observed {
            out.push(FieldChange {
                field,
                observed: observed.to_string(),
                planned: planned.to_string(),
            });
        }
    }
}

/// Lists the creation-only fields whose declared value differs from the
/// observed one. Optional fields left unset in `config` are computed by the
/// platform and never count as a change.
pub fn immutable_changes(config: &VmConfig, state: &VmState) -> Vec<FieldChange> {
    let mut out = Vec::new();
    changed("os_profile", Some(&config.os_profile), &state.os_profile, &mut out);
    changed("vdc_id", Some(&config.vdc_id), &state.vdc_id, &mut out);
    changed(
        "pool_selector",
        config.pool_selector.as_ref(),
        &state.pool_selector,
        &mut out,
    );
    changed(
        "cpu_priority",
        config.cpu_priority.as_ref(),
        &state.cpu_priority,
        &mut out,
    );
    changed("boot_media", config.boot_media.as_ref(), &state.boot_media, &mut out);
    changed("vcpu_class", config.vcpu_class.as_ref(), &state.vcpu_class, &mut out);
    changed("os_type", config.os_type.as_ref(), &state.os_type, &mut out);
    out
}

/// The mutable top-level fields of `config` that differ from `state`, as a
/// `vm-set` patch.
pub fn patch(config: &VmConfig, state: &VmState) -> api::VmPatch {
    let mut patch = api::VmPatch::default();
    if config.name != state.name {
        patch.name = Some(config.name.clone());
    }
    // The platform reports an unset description as an empty one.
    let description = config.description.as_deref().unwrap_or("");
    if description != state.description.as_deref().unwrap_or("") {
        patch.description = Some(description.to_string());
    }
    if config.cpus != state.cpus {
        patch.cpus = Some(config.cpus);
    }
    if config.ram != state.ram {
        patch.ram = Some(mb_to_bytes(config.ram));
    }
    patch
}

/// The action `config` asks for that the last observation of `state` does
/// not already reflect, if any.
///
/// A VM that has never been started is reported as stopped, but a declared
/// stop still has to take it through a first start.
pub fn pending_action(config: &VmConfig, state: &VmState) -> Option<Action> {
    let action = config.action?;
    let needs_first_start =
        action == Action::Stop && state.oper_status == VmStatus::Created.code();
    (state.action != Some(action) || needs_first_start).then_some(action)
}

/// Drives the lifecycle of VMs.
pub struct VmController {
    client: Client,
    locks: Arc<VmLocks>,
    log: Logger,
}

impl VmController {
    pub fn new(client: Client, locks: Arc<VmLocks>, log: &Logger) -> Self {
        Self { client, locks, log: log.new(o!("component" => "vm")) }
    }

    /// Creates the VM declared by `config` and returns its observed state.
    pub async fn create(&self, config: &VmConfig) -> Result<VmState, Error> {
        let mut planned = config.clone();
        for disk in planned.disks.iter_mut() {
            disk.apply_default_sector_size();
        }

        let params = mapper::create_params(&planned);
        let created = self
            .client
            .call::<api::VmsCreate>(&params)
            .await
            .map_err(Error::remote(
                api::VmsCreate::NAME,
                format!("VM {:?}", planned.name),
            ))?;
        let id = match created.id {
            Some(raw) if raw != 0 => VmId::new(raw)?,
            _ => return Err(Error::MissingVmId),
        };
        info!(self.log, "created VM"; "vm_id" => %id, "name" => &planned.name,
            "disks" => planned.disks.len());

        let _guard = self.locks.acquire(id).await;
        if let Some(action) = planned.action {
            self.apply_action(id, action).await?;
        }
        self.observe(id, planned.guest.as_ref()).await
    }

    /// Re-observes the VM described by `state`.
    pub async fn read(&self, state: &VmState) -> Result<VmState, Error> {
        let _guard = self.locks.acquire(state.id).await;
        self.observe(state.id, state.guest_config()).await
    }

    /// Brings the VM described by `state` in line with `config`.
    ///
    /// Changes to creation-only fields must have been turned into a
    /// replacement before this is called; any that remain are reported as an
    /// error before anything is sent.
    pub async fn update(
        &self,
        config: &VmConfig,
        state: &VmState,
    ) -> Result<VmState, Error> {
        let id = state.id;
        let _guard = self.locks.acquire(id).await;

        if let Some(change) = immutable_changes(config, state).into_iter().next() {
            return Err(Error::VmFieldImmutable {
                vm_id: id,
                field: change.field,
                observed: change.observed,
                planned: change.planned,
            });
        }

        let ops = diff_disks(&config.disks, &state.disks)?;
        if !ops.is_empty() {
            info!(self.log, "reconciling disks"; "vm_id" => %id,
                "operations" => ops.len());
            let bracket = RemovalBracket::for_status(state.oper_status);
            apply_disk_ops(&self.client, &self.log, id, bracket, ops).await?;
        }

        let patch = patch(config, state);
        if !patch.is_empty() {
            info!(self.log, "patching VM"; "vm_id" => %id);
            let params = api::VmSetParams { id, vm_params: patch };
            self.client
                .invoke::<api::VmSet>(&params)
                .await
                .map_err(Error::remote(api::VmSet::NAME, vm_resource(id)))?;
        }

        if let Some(action) = pending_action(config, state) {
            self.apply_action(id, action).await?;
        }

        self.observe(id, config.guest.as_ref()).await
    }

    /// Stops the VM if it is running and removes it.
    pub async fn delete(&self, state: &VmState) -> Result<(), Error> {
        let id = state.id;
        let _guard = self.locks.acquire(id).await;

        let desc = describe(&self.client, id).await?;
        if desc.oper_status == Some(VmStatus::Started.code()) {
            info!(self.log, "stopping VM before removal"; "vm_id" => %id);
            run_action(&self.client, id, Action::Stop).await?;
        }

        let vdc_id = desc.vdc.unwrap_or(state.vdc_id);
        let params = api::RemoveVmParams { id, vdc_id };
        self.client
            .invoke::<api::VmsRemove>(&params)
            .await
            .map_err(Error::remote(api::VmsRemove::NAME, vm_resource(id)))?;
        info!(self.log, "removed VM"; "vm_id" => %id, "vdc_id" => vdc_id);
        Ok(())
    }

    /// Seeds state for an existing VM from its identifier. The next read
    /// fills in everything else.
    pub fn import(&self, id: &str) -> Result<VmState, Error> {
        let id = VmId::from_str(id.trim())?;
        info!(self.log, "importing VM"; "vm_id" => %id);
        Ok(VmState::seed(id))
    }

    /// Describes an arbitrary VM without holding its lock or needing prior
    /// state.
    pub async fn lookup(&self, id: VmId) -> Result<VmState, Error> {
        let desc = describe(&self.client, id).await?;
        mapper::to_state(&desc, None)
            .map_err(|source| Error::Map { resource: vm_resource(id), source })
    }

    async fn observe(
        &self,
        id: VmId,
        guest: Option<&vstack_types::model::GuestConfig>,
    ) -> Result<VmState, Error> {
        let desc = describe(&self.client, id).await?;
        mapper::to_state(&desc, guest)
            .map_err(|source| Error::Map { resource: vm_resource(id), source })
    }

    // The platform will not stop a VM that has never been started, so a stop
    // starts the VM first unless it is observed running.
    async fn apply_action(&self, id: VmId, action: Action) -> Result<(), Error> {
        if action == Action::Stop {
            let desc = describe(&self.client, id).await?;
            let status = desc.oper_status.and_then(VmStatus::from_code);
            if !status.is_some_and(VmStatus::is_running) {
                info!(self.log, "starting VM before stopping it";
                    "vm_id" => %id,
                    "oper_status" => status.map(|s| s.to_string()));
                run_action(&self.client, id, Action::Start).await?;
            }
        }
        info!(self.log, "applying action"; "vm_id" => %id, "action" => %action);
        run_action(&self.client, id, action).await
    }
}
