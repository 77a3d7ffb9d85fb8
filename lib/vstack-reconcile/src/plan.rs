// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding what an apply has to do with a resource.
//!
//! Planning is where changes to creation-only fields turn into a replacement,
//! so the controllers' update paths only ever see in-place changes.

use vstack_types::model::{NicConfig, NicState, VmConfig, VmState};

use crate::disks::diff_disks;
use crate::nic::{declared_address, ratelimit_changed};
use crate::vm::{immutable_changes, patch, pending_action};

/// What applying a declaration to a resource requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Nothing exists yet.
    Create,
    /// The listed creation-only fields changed: destroy, then create.
    Replace(Vec<&'static str>),
    /// Some attribute can be changed in place.
    Update,
    Unchanged,
}

/// Plans the VM declared by `config` against its last observed state.
pub fn plan_vm(config: &VmConfig, state: Option<&VmState>) -> Plan {
    let Some(state) = state else {
        return Plan::Create;
    };

    let mut fields: Vec<&'static str> = immutable_changes(config, state)
        .into_iter()
        .map(|c| c.field)
        .collect();
    // Guest customization is consumed at creation only.
    let declared_guest = config.guest.clone().unwrap_or_default();
    let observed_guest = state.guest_config().cloned().unwrap_or_default();
    if declared_guest != observed_guest {
        fields.push("guest");
    }
    if !fields.is_empty() {
        return Plan::Replace(fields);
    }

    // A declaration the disk engine rejects still goes to update, which
    // reports the error.
    let disks_differ = diff_disks(&config.disks, &state.disks)
        .map_or(true, |ops| !ops.is_empty());

    if pending_action(config, state).is_some() || disks_differ || !patch(config, state).is_empty() {
        Plan::Update
    } else {
        Plan::Unchanged
    }
}

/// Plans the port declared by `config` against its last observed state.
pub fn plan_nic(config: &NicConfig, state: Option<&NicState>) -> Plan {
    let Some(state) = state else {
        return Plan::Create;
    };

    let mut fields = Vec::new();
    if config.vm_id != state.vm_id {
        fields.push("vm_id");
    }
    if config.network_id != state.network_id {
        fields.push("network_id");
    }
    if config.slot != state.slot {
        fields.push("slot");
    }
    if declared_address(config).is_some_and(|a| a != state.address) {
        fields.push("address");
    }
    if !fields.is_empty() {
        return Plan::Replace(fields);
    }

    if ratelimit_changed(config, state) {
        Plan::Update
    } else {
        Plan::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::to_state;
    use vstack_client::mock::vm_template;
    use vstack_types::model::{DiskConfig, GuestConfig};
    use vstack_types::{Action, PortId, VmId, VmStatus};

    fn observed() -> VmState {
        to_state(&vm_template(1, "app"), None).unwrap()
    }

    fn matching(state: &VmState) -> VmConfig {
        VmConfig {
            name: state.name.clone(),
            cpus: state.cpus,
            ram: state.ram,
            os_profile: state.os_profile.clone(),
            vdc_id: state.vdc_id,
            ..Default::default()
        }
    }

    #[test]
    fn vm_plans() {
        let state = observed();
        let config = matching(&state);
        assert_eq!(plan_vm(&config, None), Plan::Create);
        assert_eq!(plan_vm(&config, Some(&state)), Plan::Unchanged);

        let mut bigger = config.clone();
        bigger.cpus += 1;
        assert_eq!(plan_vm(&bigger, Some(&bigger_state(&state))), Plan::Unchanged);
        assert_eq!(plan_vm(&bigger, Some(&state)), Plan::Update);

        let mut started = config.clone();
        started.action = Some(Action::Start);
        assert_eq!(plan_vm(&started, Some(&state)), Plan::Update);
        let mut stopped = config.clone();
        stopped.action = Some(Action::Stop);
        assert_eq!(plan_vm(&stopped, Some(&state)), Plan::Unchanged);
        let never_started = VmState {
            oper_status: VmStatus::Created.code(),
            action: Some(Action::Stop),
            ..state.clone()
        };
        assert_eq!(plan_vm(&stopped, Some(&never_started)), Plan::Update);
        assert_eq!(plan_vm(&config, Some(&never_started)), Plan::Unchanged);

        // An unset description matches the empty one the platform reports.
        let blank = VmState { description: Some(String::new()), ..state.clone() };
        assert_eq!(plan_vm(&config, Some(&blank)), Plan::Unchanged);

        let mut disk = config.clone();
        disk.disks.push(DiskConfig { slot: 1, size: 5, ..Default::default() });
        assert_eq!(plan_vm(&disk, Some(&state)), Plan::Update);

        let mut moved = config.clone();
        moved.vdc_id += 1;
        moved.os_type = Some(state.os_type + 1);
        moved.guest = Some(GuestConfig {
            hostname: Some("new".to_string()),
            ..Default::default()
        });
        assert_eq!(
            plan_vm(&moved, Some(&state)),
            Plan::Replace(vec!["vdc_id", "os_type", "guest"])
        );
    }

    fn bigger_state(state: &VmState) -> VmState {
        VmState { cpus: state.cpus + 1, ..state.clone() }
    }

    #[test]
    fn nic_plans() {
        let vm_id = VmId::new(3).unwrap();
        let state = NicState {
            id: PortId::new(9).unwrap(),
            vm_id,
            network_id: 2,
            slot: 1,
            address: "10.0.0.9".to_string(),
            mac: "02:00:00:00:00:09".to_string(),
            ratelimit_mbits: None,
            ip_guard: 0,
        };
        let config = NicConfig {
            vm_id,
            network_id: 2,
            slot: 1,
            address: None,
            ratelimit_mbits: None,
            ip_guard: None,
        };
        assert_eq!(plan_nic(&config, None), Plan::Create);
        assert_eq!(plan_nic(&config, Some(&state)), Plan::Unchanged);

        let limited = NicConfig { ratelimit_mbits: Some(10), ..config.clone() };
        assert_eq!(plan_nic(&limited, Some(&state)), Plan::Update);

        let readdressed =
            NicConfig { address: Some("10.0.0.10".to_string()), ..config.clone() };
        assert_eq!(plan_nic(&readdressed, Some(&state)), Plan::Replace(vec!["address"]));

        let same_address =
            NicConfig { address: Some("10.0.0.9".to_string()), ..config.clone() };
        assert_eq!(plan_nic(&same_address, Some(&state)), Plan::Unchanged);

        // Zero and unset both mean no limit; an empty address means any.
        let unlimited = NicConfig {
            ratelimit_mbits: Some(0),
            address: Some(String::new()),
            ..config
        };
        assert_eq!(plan_nic(&unlimited, Some(&state)), Plan::Unchanged);
        let limited_state = NicState { ratelimit_mbits: Some(10), ..state.clone() };
        assert_eq!(plan_nic(&unlimited, Some(&limited_state)), Plan::Update);
    }
}
