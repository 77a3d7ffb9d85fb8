// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk reconciliation.
//!
//! Declared disks are matched against observed disks by slot. Reconciling
//! happens in two phases: [`diff_disks`] validates the whole declaration and
//! computes the operations to issue without touching the platform, and
//! [`apply_disk_ops`] issues them in order, stopping at the first failure.

use std::collections::BTreeMap;

use slog::{info, Logger};

use vstack_client::api::{self, RpcMethod};
use vstack_client::Client;
use vstack_types::model::{DiskConfig, DiskState};
use vstack_types::{gb_to_bytes, Action, SectorSize, VmId, VmStatus};

use crate::{run_action, Error};

/// A single change to a VM's disks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskOp {
    /// Grow an existing disk to `size` gigabytes.
    Resize { slot: i64, guid: String, size: i64 },
    /// Replace both rate limits of an existing disk.
    Ratelimit { slot: i64, guid: String, iops_limit: i64, mbps_limit: i64 },
    Relabel { slot: i64, guid: String, label: String },
    Add {
        slot: i64,
        size: i64,
        label: String,
        iops_limit: i64,
        mbps_limit: i64,
        sector_size: SectorSize,
    },
    Remove { slot: i64, guid: String },
}

impl DiskOp {
    pub fn slot(&self) -> i64 {
        match self {
            DiskOp::Resize { slot, .. }
            | DiskOp::Ratelimit { slot, .. }
            | DiskOp::Relabel { slot, .. }
            | DiskOp::Add { slot, .. }
            | DiskOp::Remove { slot, .. } => *slot,
        }
    }

    /// The remote method this operation is carried out by.
    pub fn method(&self) -> &'static str {
        match self {
            DiskOp::Resize { .. } => api::VmsDiskResize::NAME,
            DiskOp::Ratelimit { .. } => api::VmRatelimitDisk::NAME,
            DiskOp::Relabel { .. } => api::VmDiskSetLabel::NAME,
            DiskOp::Add { .. } => api::VmsAddDisk::NAME,
            DiskOp::Remove { .. } => api::VmRemoveDisk::NAME,
        }
    }
}

/// How each disk removal is wrapped, decided once from the VM's operational
/// status as observed before the batch began.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemovalBracket {
    /// Stop the VM before removing the disk.
    pub stop: bool,
    /// Start the VM again once the disk is gone.
    pub restart: bool,
}

impl RemovalBracket {
    /// Any VM that is not offline is stopped first, except one that has
    /// never been started, which the platform refuses to stop. Only a VM that
    /// was started is restarted afterwards.
    pub fn for_status(oper_status: i64) -> Self {
        let status = VmStatus::from_code(oper_status);
        Self {
            stop: !matches!(status, Some(VmStatus::Offline | VmStatus::Created)),
            restart: status.is_some_and(VmStatus::is_running),
        }
    }
}

/// Computes the operations that bring `observed` in line with `planned`.
///
/// Every declared disk is validated before anything is returned, so a
/// duplicate slot or an attempt to change an existing disk's sector size
/// yields an error and no operations at all. Operations come out as updates
/// to existing disks, then additions, then removals, each in slot order.
pub fn diff_disks(
    planned: &[DiskConfig],
    observed: &[DiskState],
) -> Result<Vec<DiskOp>, Error> {
    let mut plan: BTreeMap<i64, DiskConfig> = BTreeMap::new();
    for disk in planned {
        let mut disk = disk.clone();
        disk.apply_default_sector_size();
        let slot = disk.slot;
        if slot <= 0 {
            return Err(Error::InvalidSlot { slot });
        }
        if plan.insert(slot, disk).is_some() {
            return Err(Error::DuplicateSlot { slot });
        }
    }
    let state: BTreeMap<i64, &DiskState> =
        observed.iter().map(|d| (d.slot, d)).collect();

    for (slot, disk) in &plan {
        let Some(current) = state.get(slot) else { continue };
        let wanted = disk.resolved_sector_size();
        // A disk the platform reported no sector size for is not a change.
        if let Some(existing) = current.sector_size {
            if existing != wanted {
                return Err(Error::SectorSizeChange {
                    slot: *slot,
                    planned: wanted,
                    observed: existing,
                });
            }
        }
    }

    let mut updates = Vec::new();
    let mut additions = Vec::new();
    for (slot, disk) in &plan {
        match state.get(slot) {
            Some(current) => update_ops(disk, current, &mut updates),
            None => additions.push(DiskOp::Add {
                slot: *slot,
                size: disk.size,
                label: disk.label().to_string(),
                iops_limit: disk.iops_limit.unwrap_or(0),
                mbps_limit: disk.mbps_limit.unwrap_or(0),
                sector_size: disk.resolved_sector_size(),
            }),
        }
    }
    let removals = state
        .iter()
        .filter(|(slot, _)| !plan.contains_key(slot))
        .map(|(slot, disk)| DiskOp::Remove { slot: *slot, guid: disk.guid.clone() });

    updates.extend(additions);
    updates.extend(removals);
    Ok(updates)
}

fn update_ops(planned: &DiskConfig, current: &DiskState, ops: &mut Vec<DiskOp>) {
    let slot = planned.slot;
    let guid = &current.guid;

    // Only growth is ever issued; a smaller declared size is left alone.
    if planned.size > current.size {
        ops.push(DiskOp::Resize {
            slot,
            guid: guid.clone(),
            size: planned.size,
        });
    }

    let iops_limit = planned.iops_limit.unwrap_or(0);
    let mbps_limit = planned.mbps_limit.unwrap_or(0);
    if iops_limit != current.iops_limit.unwrap_or(0)
        || mbps_limit != current.mbps_limit.unwrap_or(0)
    {
        ops.push(DiskOp::Ratelimit {
            slot,
            guid: guid.clone(),
            iops_limit,
            mbps_limit,
        });
    }

    if planned.label() != current.label {
        ops.push(DiskOp::Relabel {
            slot,
            guid: guid.clone(),
            label: planned.label().to_string(),
        });
    }
}

/// Issues `ops` against the VM `vm_id`.
///
/// Every removal is wrapped as `bracket` says; the VM's status is not
/// re-checked between removals.
pub async fn apply_disk_ops(
    client: &Client,
    log: &Logger,
    vm_id: VmId,
    bracket: RemovalBracket,
    ops: Vec<DiskOp>,
) -> Result<(), Error> {
    for op in ops {
        let resource = format!("VM {vm_id} disk slot {}", op.slot());
        let method = op.method();
        let fail = |source| Error::Remote {
            operation: method,
            resource: resource.clone(),
            source,
        };

        match op {
            DiskOp::Resize { slot, guid, size } => {
                info!(log, "growing disk"; "vm_id" => %vm_id, "slot" => slot,
                    "size_gb" => size);
                let params = api::ResizeDiskParams {
                    id: vm_id,
                    disk_guid: guid,
                    size: gb_to_bytes(size),
                };
                client.invoke::<api::VmsDiskResize>(&params).await.map_err(fail)?;
            }
            DiskOp::Ratelimit { slot, guid, iops_limit, mbps_limit } => {
                info!(log, "setting disk rate limits"; "vm_id" => %vm_id,
                    "slot" => slot, "iops_limit" => iops_limit,
                    "mbps_limit" => mbps_limit);
                let params = api::RatelimitDiskParams {
                    vm_id,
                    disk_guid: guid,
                    mbps_limit,
                    iops_limit,
                };
                client
                    .invoke::<api::VmRatelimitDisk>(&params)
                    .await
                    .map_err(fail)?;
            }
            DiskOp::Relabel { slot, guid, label } => {
                info!(log, "relabeling disk"; "vm_id" => %vm_id,
                    "slot" => slot, "label" => &label);
                let params = api::DiskLabelParams { vm_id, guid, label };
                client.invoke::<api::VmDiskSetLabel>(&params).await.map_err(fail)?;
            }
            DiskOp::Add {
                slot,
                size,
                label,
                iops_limit,
                mbps_limit,
                sector_size,
            } => {
                info!(log, "adding disk"; "vm_id" => %vm_id, "slot" => slot,
                    "size_gb" => size, "sector_size" => %sector_size);
                let params = api::AddDiskParams {
                    vm_id,
                    size: gb_to_bytes(size),
                    slot,
                    label,
                    sector_size,
                    iops_limit,
                    mbps_limit,
                };
                client.invoke::<api::VmsAddDisk>(&params).await.map_err(fail)?;
            }
            DiskOp::Remove { slot, guid } => {
                info!(log, "removing disk"; "vm_id" => %vm_id, "slot" => slot,
                    "stop" => bracket.stop, "restart" => bracket.restart);
                if bracket.stop {
                    run_action(client, vm_id, Action::Stop).await?;
                }
                let params = api::RemoveDiskParams { vm_id, disk_guid: guid };
                client.invoke::<api::VmRemoveDisk>(&params).await.map_err(fail)?;
                if bracket.restart {
                    run_action(client, vm_id, Action::Start).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_client, test_logger};
    use vstack_client::mock::{vm_template, Failure};
    use vstack_types::{SectorSizeSpec, VmStatus};

    fn planned(slot: i64, size: i64) -> DiskConfig {
        DiskConfig { slot, size, ..Default::default() }
    }

    fn observed(slot: i64, size: i64) -> DiskState {
        DiskState {
            guid: format!("g-{slot}"),
            slot,
            size,
            iops_limit: None,
            mbps_limit: None,
            label: String::new(),
            sector_size: Some(SectorSize::DEFAULT),
        }
    }

    #[test]
    fn matching_disks_need_nothing() {
        let ops = diff_disks(
            &[planned(1, 10), planned(2, 20)],
            &[observed(1, 10), observed(2, 20)],
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn slots_partition_into_update_add_remove() {
        let mut one = planned(1, 15);
        one.label = Some("root".to_string());
        let ops =
            diff_disks(&[one, planned(2, 5)], &[observed(1, 10), observed(3, 8)])
                .unwrap();
        assert_eq!(
            ops,
            vec![
                DiskOp::Resize { slot: 1, guid: "g-1".to_string(), size: 15 },
                DiskOp::Relabel {
                    slot: 1,
                    guid: "g-1".to_string(),
                    label: "root".to_string(),
                },
                DiskOp::Add {
                    slot: 2,
                    size: 5,
                    label: String::new(),
                    iops_limit: 0,
                    mbps_limit: 0,
                    sector_size: SectorSize::DEFAULT,
                },
                DiskOp::Remove { slot: 3, guid: "g-3".to_string() },
            ]
        );
    }

    #[test]
    fn shrinking_is_never_issued() {
        let ops = diff_disks(&[planned(1, 5)], &[observed(1, 10)]).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn ratelimits_change_together() {
        let mut disk = planned(1, 10);
        disk.iops_limit = Some(300);
        let mut current = observed(1, 10);
        current.mbps_limit = Some(50);
        let ops = diff_disks(&[disk], &[current]).unwrap();
        assert_eq!(
            ops,
            vec![DiskOp::Ratelimit {
                slot: 1,
                guid: "g-1".to_string(),
                iops_limit: 300,
                mbps_limit: 0,
            }]
        );
    }

    #[test]
    fn unset_limits_match_zero() {
        let mut disk = planned(1, 10);
        disk.iops_limit = Some(0);
        let mut current = observed(1, 10);
        current.mbps_limit = Some(0);
        assert!(diff_disks(&[disk], &[current]).unwrap().is_empty());
    }

    #[test]
    fn sector_size_change_is_rejected() {
        let mut disk = planned(2, 10);
        disk.sector_size =
            Some(SectorSizeSpec { logical: Some(4096), physical: None });
        let err = diff_disks(
            &[planned(1, 99), disk],
            &[observed(1, 10), observed(2, 10)],
        )
        .unwrap_err();
        match &err {
            Error::SectorSizeChange { slot, planned, observed } => {
                assert_eq!(*slot, 2);
                assert_eq!(*planned, SectorSize { logical: 4096, physical: 4096 });
                assert_eq!(*observed, SectorSize::DEFAULT);
            }
            other => panic!("unexpected error: {other}"),
        }
        let text = err.to_string();
        assert!(text.contains("slot 2"), "{text}");
        assert!(text.contains("remove the disk and add it again"), "{text}");
    }

    #[test]
    fn unreported_sector_size_is_not_a_change() {
        let mut current = observed(1, 10);
        current.sector_size = None;
        let mut disk = planned(1, 10);
        disk.sector_size =
            Some(SectorSizeSpec { logical: Some(4096), physical: Some(4096) });
        assert!(diff_disks(&[disk], &[current]).unwrap().is_empty());
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let err = diff_disks(&[planned(1, 1), planned(2, 1), planned(1, 3)], &[])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSlot { slot: 1 }));
    }

    #[test]
    fn slots_must_be_positive() {
        for slot in [0, -2] {
            let err = diff_disks(&[planned(1, 1), planned(slot, 1)], &[])
                .unwrap_err();
            assert!(matches!(err, Error::InvalidSlot { slot: s } if s == slot));
        }
    }

    #[test]
    fn bracket_follows_prior_status() {
        let bracket = |s: VmStatus| RemovalBracket::for_status(s.code());
        assert_eq!(
            bracket(VmStatus::Started),
            RemovalBracket { stop: true, restart: true }
        );
        for status in [VmStatus::Offline, VmStatus::Created] {
            assert_eq!(
                bracket(status),
                RemovalBracket { stop: false, restart: false }
            );
        }
        for status in
            [VmStatus::Suspended, VmStatus::Starting, VmStatus::StopFailed]
        {
            assert_eq!(
                bracket(status),
                RemovalBracket { stop: true, restart: false }
            );
        }
        assert!(RemovalBracket::for_status(0).stop);
    }

    #[tokio::test]
    async fn removals_are_bracketed_when_running() {
        let (mock, client) = mock_client();
        let mut desc = vm_template(10, "a");
        desc.oper_status = Some(VmStatus::Started.code());
        for slot in [1, 2] {
            desc.disks.push(api::DiskDescription {
                guid: Some(format!("g-{slot}")),
                size: Some(gb_to_bytes(1)),
                slot: Some(slot),
                ..Default::default()
            });
        }
        let id = mock.insert_vm(desc);

        let ops = diff_disks(&[], &[observed(1, 1), observed(2, 1)]).unwrap();
        let bracket = RemovalBracket::for_status(VmStatus::Started.code());
        apply_disk_ops(&client, &test_logger(), id, bracket, ops).await.unwrap();

        assert_eq!(
            mock.methods(),
            vec![
                "vms-stop",
                "vm-remove-disk",
                "vms-restart",
                "vms-stop",
                "vm-remove-disk",
                "vms-restart",
            ]
        );
        assert!(mock.vm(id).unwrap().disks.is_empty());
    }

    #[tokio::test]
    async fn suspended_vm_is_stopped_but_not_restarted() {
        let (mock, client) = mock_client();
        let mut desc = vm_template(12, "c");
        desc.oper_status = Some(VmStatus::Suspended.code());
        desc.disks.push(api::DiskDescription {
            guid: Some("g-2".to_string()),
            size: Some(gb_to_bytes(1)),
            slot: Some(2),
            ..Default::default()
        });
        let id = mock.insert_vm(desc);

        let ops = diff_disks(&[], &[observed(2, 1)]).unwrap();
        let bracket = RemovalBracket::for_status(VmStatus::Suspended.code());
        apply_disk_ops(&client, &test_logger(), id, bracket, ops).await.unwrap();

        assert_eq!(mock.methods(), vec!["vms-stop", "vm-remove-disk"]);
        assert_eq!(
            mock.vm(id).unwrap().oper_status,
            Some(VmStatus::Offline.code())
        );
    }

    #[tokio::test]
    async fn failure_stops_the_batch() {
        let (mock, client) = mock_client();
        let mut desc = vm_template(11, "b");
        desc.disks.push(api::DiskDescription {
            guid: Some("g-1".to_string()),
            size: Some(gb_to_bytes(1)),
            slot: Some(1),
            ..Default::default()
        });
        let id = mock.insert_vm(desc);
        mock.fail_next(
            "vms-disk-resize",
            Failure::Domain { code: 5, message: "pool is full".to_string() },
        );

        let ops = diff_disks(&[planned(1, 2), planned(2, 1)], &[observed(1, 1)])
            .unwrap();
        let bracket = RemovalBracket::for_status(VmStatus::Offline.code());
        let err = apply_disk_ops(&client, &test_logger(), id, bracket, ops)
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("vms-disk-resize"), "{text}");
        assert!(text.contains("slot 1"), "{text}");
        assert!(text.contains("pool is full"), "{text}");
        assert_eq!(mock.methods(), vec!["vms-disk-resize"]);
    }
}
