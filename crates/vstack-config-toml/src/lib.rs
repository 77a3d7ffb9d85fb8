// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing of provider settings and resource declarations from TOML.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use vstack_types::model::{NicConfig, VmConfig};

/// Configuration for talking to a vStack platform.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub provider: Provider,
}

/// Connection settings for the platform's API endpoint.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Provider {
    /// Base URL of the platform, e.g. "https://vstack.example.com".
    pub host: String,

    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Name of an environment variable holding the password. Consulted only
    /// when `password` is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Provider {
    /// The base URL with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        self.host.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Resolves the password from the file or, failing that, from the
    /// environment variable named by `password_env`.
    pub fn password(&self) -> Result<String, ParseError> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        let Some(var) = &self.password_env else {
            return Err(ParseError::MissingPassword);
        };
        std::env::var(var)
            .map_err(|source| ParseError::Env { var: var.clone(), source })
    }
}

/// A file declaring a single VM under a `[vm]` table.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VmDeclaration {
    pub vm: VmConfig,
}

/// A file declaring a single network port under a `[nic]` table.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NicDeclaration {
    pub nic: NicConfig,
}

/// Errors which may be returned when parsing configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider password is not set; set `password` or `password_env`")]
    MissingPassword,

    #[error("Cannot read password from environment variable {var}: {source}")]
    Env {
        var: String,
        #[source]
        source: std::env::VarError,
    },
}

/// Parses a TOML file into a provider configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

/// Parses a TOML file containing a `[vm]` declaration.
pub fn parse_vm<P: AsRef<Path>>(path: P) -> Result<VmConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let decl = toml::from_str::<VmDeclaration>(&contents)?;
    Ok(decl.vm)
}

/// Parses a TOML file containing a `[nic]` declaration.
pub fn parse_nic<P: AsRef<Path>>(path: P) -> Result<NicConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let decl = toml::from_str::<NicDeclaration>(&contents)?;
    Ok(decl.nic)
}
