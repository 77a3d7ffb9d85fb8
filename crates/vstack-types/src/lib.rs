// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by other vStack crates.
//!
//! This crate defines some basic types that are shared by multiple other
//! vStack crates (client, reconciler, config parser and/or CLI) such that they
//! can all use those types (and implement their own conversions to/from them)
//! without any layering oddities.

use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub mod model;
pub mod status;

pub use status::{Action, ActionParseError, VmStatus};

const BYTES_PER_MIB: i64 = 1024 * 1024;
const BYTES_PER_GIB: i64 = 1024 * BYTES_PER_MIB;

/// Errors produced when validating or parsing a remote identifier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} id must be a positive integer, got {value}")]
    NotPositive { kind: &'static str, value: i64 },

    #[error("cannot parse {kind} id from {input:?}: {source}")]
    Parse {
        kind: &'static str,
        input: String,
        #[source]
        source: ParseIntError,
    },
}

macro_rules! remote_id {
    ($(#[$attr:meta])* $name:ident, $kind:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw identifier, rejecting zero and negative values.
            pub fn new(raw: i64) -> Result<Self, IdError> {
                if raw <= 0 {
                    return Err(IdError::NotPositive { kind: $kind, value: raw });
                }
                Ok(Self(raw))
            }

            #[inline]
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = i64::from_str(s).map_err(|source| IdError::Parse {
                    kind: $kind,
                    input: s.to_string(),
                    source,
                })?;
                Self::new(raw)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = IdError;
            fn try_from(raw: i64) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'d> Deserialize<'d> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'d>,
            {
                let raw = i64::deserialize(deserializer)?;
                Self::new(raw).map_err(de::Error::custom)
            }
        }
    };
}

remote_id!(
    /// A virtual machine identifier assigned by the platform at creation.
    VmId,
    "VM"
);

remote_id!(
    /// A network port (NIC) identifier assigned by the platform when the port
    /// is added to a VM.
    PortId,
    "port"
);

/// Errors which may be returned when parsing a NIC import identifier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ImportIdError {
    #[error("expected import id in the format 'vm_id/port_id', got {0:?}")]
    Format(String),

    #[error("invalid VM id in import id {input:?}: {source}")]
    VmId {
        input: String,
        #[source]
        source: IdError,
    },

    #[error("invalid port id in import id {input:?}: {source}")]
    PortId {
        input: String,
        #[source]
        source: IdError,
    },
}

/// The external identifier of an existing NIC, formatted as
/// "<vm_id>/<port_id>", e.g. "42/7".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NicImportId {
    pub vm_id: VmId,
    pub port_id: PortId,
}

impl FromStr for NicImportId {
    type Err = ImportIdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('/').collect();
        if fields.len() != 2 {
            return Err(ImportIdError::Format(s.to_string()));
        }

        let vm_id = VmId::from_str(fields[0]).map_err(|source| {
            ImportIdError::VmId { input: s.to_string(), source }
        })?;
        let port_id = PortId::from_str(fields[1]).map_err(|source| {
            ImportIdError::PortId { input: s.to_string(), source }
        })?;

        Ok(Self { vm_id, port_id })
    }
}

impl Display for NicImportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vm_id, self.port_id)
    }
}

/// Logical and physical sector sizes of a disk, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSize {
    pub logical: i64,
    pub physical: i64,
}

impl SectorSize {
    /// The sector size used for any half of a disk's sector size that the
    /// configuration leaves unset.
    pub const DEFAULT: Self = Self { logical: 512, physical: 4096 };
}

impl Default for SectorSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for SectorSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.logical, self.physical)
    }
}

/// A possibly-partial sector size as written in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSizeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<i64>,
}

impl SectorSizeSpec {
    /// Fills any unset half with [`SectorSize::DEFAULT`].
    pub fn resolve(&self) -> SectorSize {
        SectorSize {
            logical: self.logical.unwrap_or(SectorSize::DEFAULT.logical),
            physical: self.physical.unwrap_or(SectorSize::DEFAULT.physical),
        }
    }
}

impl From<SectorSize> for SectorSizeSpec {
    fn from(size: SectorSize) -> Self {
        Self { logical: Some(size.logical), physical: Some(size.physical) }
    }
}

/// Converts megabytes (the unit used in configuration for RAM) to bytes.
pub fn mb_to_bytes(mb: i64) -> i64 {
    mb.saturating_mul(BYTES_PER_MIB)
}

/// Converts bytes to whole megabytes, truncating any remainder.
pub fn bytes_to_mb(bytes: i64) -> i64 {
    bytes / BYTES_PER_MIB
}

/// Converts gigabytes (the unit used in configuration for disks) to bytes.
pub fn gb_to_bytes(gb: i64) -> i64 {
    gb.saturating_mul(BYTES_PER_GIB)
}

/// Converts bytes to whole gigabytes, truncating any remainder.
pub fn bytes_to_gb(bytes: i64) -> i64 {
    bytes / BYTES_PER_GIB
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;
    use serde_test::{assert_tokens, Token};

    const IMPORT_CASES: &[(&str, Result<(i64, i64), ()>)] = &[
        ("42/7", Ok((42, 7))),
        ("1/1", Ok((1, 1))),
        ("abc", Err(())),
        ("42", Err(())),
        ("42/", Err(())),
        ("/7", Err(())),
        ("42/7/1", Err(())),
        ("0/7", Err(())),
        ("42/-7", Err(())),
        ("x/7", Err(())),
        ("", Err(())),
    ];

    #[test]
    fn nic_import_id_from_str() {
        for (input, expected) in IMPORT_CASES {
            match NicImportId::from_str(input) {
                Ok(id) => {
                    let (vm, port) = expected.unwrap();
                    assert_eq!(id.vm_id.get(), vm);
                    assert_eq!(id.port_id.get(), port);
                    assert_eq!(id.to_string(), *input);
                }
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing import id {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn nic_import_id_errors_name_the_offending_half() {
        assert_eq!(
            NicImportId::from_str("42"),
            Err(ImportIdError::Format("42".to_string()))
        );
        assert!(matches!(
            NicImportId::from_str("abc"),
            Err(ImportIdError::Format(_))
        ));
        assert!(matches!(
            NicImportId::from_str("x/7"),
            Err(ImportIdError::VmId { .. })
        ));
        let err = NicImportId::from_str("42/y").unwrap_err();
        assert!(matches!(err, ImportIdError::PortId { .. }));
        assert!(err.to_string().contains("port id"));
    }

    #[test]
    fn ids_reject_non_positive_values() {
        assert!(VmId::new(0).is_err());
        assert!(VmId::new(-3).is_err());
        assert_eq!(VmId::new(5).unwrap().get(), 5);
        assert!(PortId::from_str("0").is_err());
        assert!(matches!(
            VmId::from_str("twelve"),
            Err(IdError::Parse { kind: "VM", .. })
        ));
    }

    #[test]
    fn id_serialization() {
        assert_tokens(&VmId::new(42).unwrap(), &[Token::I64(42)]);
        assert_tokens(&PortId::new(7).unwrap(), &[Token::I64(7)]);

        let tokens = [Token::I64(0)];
        let mut de = serde_test::Deserializer::new(&tokens);
        assert!(VmId::deserialize(&mut de).is_err());
    }

    #[test]
    fn sector_size_defaults_fill_each_half() {
        assert_eq!(SectorSizeSpec::default().resolve(), SectorSize::DEFAULT);
        assert_eq!(
            SectorSizeSpec { logical: Some(4096), physical: None }.resolve(),
            SectorSize { logical: 4096, physical: 4096 }
        );
        assert_eq!(
            SectorSizeSpec { logical: None, physical: Some(512) }.resolve(),
            SectorSize { logical: 512, physical: 512 }
        );
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(mb_to_bytes(1024), 1024 * 1024 * 1024);
        assert_eq!(bytes_to_mb(mb_to_bytes(2048)), 2048);
        assert_eq!(gb_to_bytes(10), 10 * 1024 * 1024 * 1024);
        assert_eq!(bytes_to_gb(gb_to_bytes(10) + 1), 10);
    }
}
