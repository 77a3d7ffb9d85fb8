// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operational status registry and the actions that move a VM between
//! operational states.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operational status codes reported by the platform for a VM.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(i64)]
pub enum VmStatus {
    Offline = 1,
    Starting = 2,
    Started = 3,
    StartFailed = 4,
    Stopping = 5,
    StopFailed = 6,
    Creating = 7,
    Deleting = 8,
    Deleted = 9,
    Created = 10,
    Suspended = 11,
    Suspending = 12,
    SuspendFailed = 13,
    Resuming = 14,
    ResumeFailed = 15,
    CreateFailed = 16,
    DeleteFailed = 17,
}

impl VmStatus {
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Looks up a status by its wire code. Unknown codes yield `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::from_repr(code)
    }

    /// Only a started VM counts as running when deciding whether a mutation
    /// must be bracketed by a stop and a restart.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Started)
    }
}

/// A requested change to a VM's operational status.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported action {0:?}, supported actions are 'start' and 'stop'")]
pub struct ActionParseError(pub String);

impl Action {
    /// The remote method that carries out this action. Starting is
    /// implemented by the platform's restart operation.
    pub const fn method(self) -> &'static str {
        match self {
            Self::Start => "vms-restart",
            Self::Stop => "vms-stop",
        }
    }

    /// The operational status a VM settles in once the action completes.
    pub fn target_status(self) -> VmStatus {
        match self {
            Self::Start => VmStatus::Started,
            Self::Stop => VmStatus::Offline,
        }
    }

    /// Derives the action that describes an observed operational status.
    ///
    /// A freshly created VM that has never run is reported as stopped. Any
    /// transitional or failed status yields `None`, meaning the observed
    /// state should be left as it is.
    pub fn observed(oper_status: i64) -> Option<Self> {
        match VmStatus::from_code(oper_status)? {
            VmStatus::Started => Some(Self::Start),
            VmStatus::Offline | VmStatus::Created => Some(Self::Stop),
            _ => None,
        }
    }
}

impl FromStr for Action {
    type Err = ActionParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            _ => Err(ActionParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn status_codes_round_trip() {
        for status in VmStatus::iter() {
            assert_eq!(VmStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(VmStatus::from_code(0), None);
        assert_eq!(VmStatus::from_code(18), None);
        assert_eq!(VmStatus::Created.code(), 10);
        assert_eq!(VmStatus::StopFailed.to_string(), "stop_failed");
    }

    #[test]
    fn only_started_is_running() {
        let running: Vec<_> =
            VmStatus::iter().filter(|s| s.is_running()).collect();
        assert_eq!(running, vec![VmStatus::Started]);
    }

    #[test]
    fn action_registry() {
        assert_eq!(Action::Start.method(), "vms-restart");
        assert_eq!(Action::Stop.method(), "vms-stop");
        assert_eq!(Action::Start.target_status(), VmStatus::Started);
        assert_eq!(Action::Stop.target_status(), VmStatus::Offline);
        assert_eq!(Action::from_str("START"), Ok(Action::Start));
        assert_eq!(Action::from_str("stop"), Ok(Action::Stop));
        assert!(Action::from_str("reboot").is_err());
    }

    #[test]
    fn action_derived_from_status() {
        assert_eq!(Action::observed(3), Some(Action::Start));
        assert_eq!(Action::observed(1), Some(Action::Stop));
        assert_eq!(Action::observed(10), Some(Action::Stop));
        assert_eq!(Action::observed(2), None);
        assert_eq!(Action::observed(5), None);
        assert_eq!(Action::observed(99), None);
    }
}
