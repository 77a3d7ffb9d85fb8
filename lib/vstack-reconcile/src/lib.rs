// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of declared VMs and network ports against the state of a
//! vStack platform.
//!
//! The controllers in this crate take a declared configuration and the last
//! observed state, issue the remote operations needed to converge the two,
//! and return the newly observed state. Persisting that state is left to the
//! caller.

use thiserror::Error;

use vstack_client::Client;
use vstack_types::{IdError, PortId, SectorSize, VmId};

pub mod disks;
pub mod locks;
pub mod mapper;
pub mod nic;
pub mod plan;
pub mod profiles;
pub mod vm;

pub use disks::{DiskOp, RemovalBracket};
pub use locks::VmLocks;
pub use mapper::MapError;
pub use nic::NicController;
pub use plan::Plan;
pub use vm::VmController;

/// Errors which may be returned while reconciling a resource.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} failed for {resource}: {source}")]
    Remote {
        operation: &'static str,
        resource: String,
        #[source]
        source: vstack_client::Error,
    },

    #[error("cannot map the description of {resource}: {source}")]
    Map {
        resource: String,
        #[source]
        source: MapError,
    },

    #[error(
        "disk in slot {slot}: sector size cannot change from {observed} to \
         {planned}; remove the disk and add it again instead"
    )]
    SectorSizeChange { slot: i64, planned: SectorSize, observed: SectorSize },

    #[error("disk slot {slot} is declared more than once")]
    DuplicateSlot { slot: i64 },

    #[error("disk slot {slot} is invalid; slots are positive integers")]
    InvalidSlot { slot: i64 },

    #[error(
        "VM {vm_id}: {field} cannot change in place (from {observed} to \
         {planned}); the VM must be replaced"
    )]
    VmFieldImmutable {
        vm_id: VmId,
        field: &'static str,
        observed: String,
        planned: String,
    },

    #[error(
        "port {port_id} on VM {vm_id}: {field} cannot change in place (from \
         {observed} to {planned}); the port must be replaced"
    )]
    NicFieldImmutable {
        vm_id: VmId,
        port_id: PortId,
        field: &'static str,
        observed: String,
        planned: String,
    },

    #[error("vms-create did not return a VM id")]
    MissingVmId,

    #[error("port {port_id} is no longer attached to VM {vm_id}")]
    NicNotFound { vm_id: VmId, port_id: PortId },

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    ImportId(#[from] vstack_types::ImportIdError),
}

impl Error {
    fn remote(
        operation: &'static str,
        resource: impl Into<String>,
    ) -> impl FnOnce(vstack_client::Error) -> Self {
        let resource = resource.into();
        move |source| Self::Remote { operation, resource, source }
    }
}

pub(crate) fn vm_resource(id: VmId) -> String {
    format!("VM {id}")
}

/// Runs `action` on a VM, attributing any failure to that VM.
pub(crate) async fn run_action(
    client: &Client,
    id: VmId,
    action: vstack_types::Action,
) -> Result<(), Error> {
    client
        .run_action(action, id)
        .await
        .map_err(Error::remote(action.method(), vm_resource(id)))
}

/// Describes a VM, attributing any failure to that VM.
pub(crate) async fn describe(
    client: &Client,
    id: VmId,
) -> Result<vstack_client::api::VmDescription, Error> {
    use vstack_client::RpcMethod;

    client
        .vm_get(id)
        .await
        .map_err(Error::remote(vstack_client::api::VmGet::NAME, vm_resource(id)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use slog::{o, Logger};
    use vstack_client::mock::MockVstack;
    use vstack_client::Client;

    pub fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    pub fn mock_client() -> (Arc<MockVstack>, Client) {
        let mock = Arc::new(MockVstack::new());
        let client = Client::new(mock.clone(), test_logger());
        (mock, client)
    }
}
