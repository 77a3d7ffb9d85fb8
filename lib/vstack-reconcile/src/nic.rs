// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network port lifecycle.
//!
//! A port is a resource of its own but lives inside a VM: every operation
//! holds the owning VM's lock, and adding or removing a port requires the VM
//! to be stopped, so a running VM is stopped beforehand and restarted
//! afterwards.

use std::str::FromStr;
use std::sync::Arc;

use slog::{info, o, Logger};

use vstack_client::api::{self, RpcMethod};
use vstack_client::Client;
use vstack_types::model::{NicConfig, NicState};
use vstack_types::{Action, NicImportId, PortId, VmId, VmStatus};

use crate::{describe, mapper, run_action, Error, VmLocks};

fn port_resource(vm_id: VmId, port: impl std::fmt::Display) -> String {
    format!("VM {vm_id} port {port}")
}

/// Whether the declared rate limit differs from the observed one. The
/// platform reads back a limit of zero as no limit at all.
pub fn ratelimit_changed(config: &NicConfig, state: &NicState) -> bool {
    config.ratelimit_mbits.unwrap_or(0) != state.ratelimit_mbits.unwrap_or(0)
}

/// The address `config` pins the port to, if any. An empty address leaves
/// the choice to the platform.
pub fn declared_address(config: &NicConfig) -> Option<&str> {
    config.address.as_deref().filter(|a| !a.is_empty())
}

/// Drives the lifecycle of network ports.
pub struct NicController {
    client: Client,
    locks: Arc<VmLocks>,
    log: Logger,
}

impl NicController {
    pub fn new(client: Client, locks: Arc<VmLocks>, log: &Logger) -> Self {
        Self { client, locks, log: log.new(o!("component" => "nic")) }
    }

    /// Adds the port declared by `config` to its VM.
    pub async fn create(&self, config: &NicConfig) -> Result<NicState, Error> {
        let vm_id = config.vm_id;
        let _guard = self.locks.acquire(vm_id).await;

        let was_running = self.is_running(vm_id).await?;
        if was_running {
            run_action(&self.client, vm_id, Action::Stop).await?;
        }

        let params = api::AddNicParams {
            id: vm_id,
            network_id: config.network_id,
            slot: config.slot,
            ratelimit_mbits: config.ratelimit_mbits.filter(|&r| r != 0),
            address: declared_address(config).map(str::to_string),
            ip_guard: config.ip_guard.filter(|&g| g != 0),
        };
        let port = self
            .client
            .call::<api::VmsAddNic>(&params)
            .await
            .map_err(Error::remote(
                api::VmsAddNic::NAME,
                port_resource(vm_id, format!("in slot {}", config.slot)),
            ))?;

        if was_running {
            run_action(&self.client, vm_id, Action::Start).await?;
        }

        let mut state = mapper::port_to_state(vm_id, &port).map_err(|source| {
            Error::Map { resource: port_resource(vm_id, port.port_id), source }
        })?;
        // A declared address stands unless the platform reports one.
        if port.address.is_empty() {
            state.address = config.address.clone().unwrap_or_default();
        }
        info!(self.log, "added port"; "vm_id" => %vm_id,
            "port_id" => %state.id, "slot" => state.slot,
            "restarted" => was_running);
        Ok(state)
    }

    /// Re-observes a port. Returns `None` if the port is no longer attached
    /// to its VM, in which case it should be forgotten.
    pub async fn read(&self, state: &NicState) -> Result<Option<NicState>, Error> {
        let _guard = self.locks.acquire(state.vm_id).await;
        let found = self.find(state.vm_id, state.id).await?;
        if found.is_none() {
            info!(self.log, "port has disappeared"; "vm_id" => %state.vm_id,
                "port_id" => %state.id);
        }
        Ok(found)
    }

    /// Applies a changed rate limit, the only attribute that can change in
    /// place, and re-observes the port.
    pub async fn update(
        &self,
        config: &NicConfig,
        state: &NicState,
    ) -> Result<NicState, Error> {
        let (vm_id, port_id) = (state.vm_id, state.id);
        let _guard = self.locks.acquire(vm_id).await;

        let immutable = [
            ("vm_id", config.vm_id.to_string(), state.vm_id.to_string()),
            ("network_id", config.network_id.to_string(), state.network_id.to_string()),
            ("slot", config.slot.to_string(), state.slot.to_string()),
        ];
        let address = declared_address(config)
            .filter(|a| *a != state.address)
            .map(|a| ("address", a.to_string(), state.address.clone()));
        let changed = immutable
            .into_iter()
            .filter(|(_, planned, observed)| planned != observed)
            .chain(address)
            .next();
        if let Some((field, planned, observed)) = changed {
            return Err(Error::NicFieldImmutable {
                vm_id,
                port_id,
                field,
                observed,
                planned,
            });
        }

        if ratelimit_changed(config, state) {
            let ratelimit_mbits = config.ratelimit_mbits.unwrap_or(0);
            info!(self.log, "setting port rate limit"; "vm_id" => %vm_id,
                "port_id" => %port_id, "ratelimit_mbits" => ratelimit_mbits);
            let params = api::RatelimitNicParams { vm_id, port_id, ratelimit_mbits };
            self.client
                .invoke::<api::VmRatelimitNic>(&params)
                .await
                .map_err(Error::remote(
                    api::VmRatelimitNic::NAME,
                    port_resource(vm_id, port_id),
                ))?;
        }

        self.find(vm_id, port_id)
            .await?
            .ok_or(Error::NicNotFound { vm_id, port_id })
    }

    /// Detaches the port from its VM.
    pub async fn delete(&self, state: &NicState) -> Result<(), Error> {
        let (vm_id, port_id) = (state.vm_id, state.id);
        let _guard = self.locks.acquire(vm_id).await;

        let was_running = self.is_running(vm_id).await?;
        if was_running {
            run_action(&self.client, vm_id, Action::Stop).await?;
        }

        let params = api::RemoveNicParams { vm_id, port_id };
        self.client
            .invoke::<api::VmRemoveNic>(&params)
            .await
            .map_err(Error::remote(
                api::VmRemoveNic::NAME,
                port_resource(vm_id, port_id),
            ))?;

        if was_running {
            run_action(&self.client, vm_id, Action::Start).await?;
        }
        info!(self.log, "removed port"; "vm_id" => %vm_id,
            "port_id" => %port_id, "restarted" => was_running);
        Ok(())
    }

    /// Seeds state for an existing port from an id of the form
    /// `<vm_id>/<port_id>`. The next read fills in everything else.
    pub fn import(&self, id: &str) -> Result<NicState, Error> {
        let id = NicImportId::from_str(id.trim())?;
        info!(self.log, "importing port"; "vm_id" => %id.vm_id,
            "port_id" => %id.port_id);
        Ok(NicState::seed(id))
    }

    async fn is_running(&self, vm_id: VmId) -> Result<bool, Error> {
        let desc = describe(&self.client, vm_id).await?;
        Ok(desc.oper_status == Some(VmStatus::Started.code()))
    }

    // There is no way to fetch a single port, so scan the VM's ports.
    async fn find(
        &self,
        vm_id: VmId,
        port_id: PortId,
    ) -> Result<Option<NicState>, Error> {
        let desc = describe(&self.client, vm_id).await?;
        desc.network_ports
            .iter()
            .find(|p| p.port_id == port_id.get())
            .map(|p| {
                mapper::port_to_state(vm_id, p).map_err(|source| Error::Map {
                    resource: port_resource(vm_id, port_id),
                    source,
                })
            })
            .transpose()
    }
}
