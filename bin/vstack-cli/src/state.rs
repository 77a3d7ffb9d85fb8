// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted resource state, one JSON file per declared resource.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The kind of resource a state file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Vm,
    Nic,
}

impl Kind {
    fn prefix(self) -> &'static str {
        match self {
            Kind::Vm => "vm",
            Kind::Nic => "nic",
        }
    }
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The state file for the resource declared in `declaration`, named
    /// after the declaration's file stem.
    pub fn path(&self, kind: Kind, declaration: &Path) -> anyhow::Result<PathBuf> {
        let stem = declaration
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| {
                format!("cannot derive a state name from {}", declaration.display())
            })?;
        Ok(self.dir.join(format!("{}-{stem}.json", kind.prefix())))
    }

    pub fn load<T: DeserializeOwned>(
        &self,
        kind: Kind,
        declaration: &Path,
    ) -> anyhow::Result<Option<T>> {
        let path = self.path(kind, declaration)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading {}", path.display()))
            }
        };
        let state = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save<T: Serialize>(
        &self,
        kind: Kind,
        declaration: &Path,
        state: &T,
    ) -> anyhow::Result<()> {
        let path = self.path(kind, declaration)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let text = serde_json::to_string_pretty(state)?;
        // The state file is only ever replaced whole.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn remove(&self, kind: Kind, declaration: &Path) -> anyhow::Result<()> {
        let path = self.path(kind, declaration)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vstack_types::model::NicState;
    use vstack_types::NicImportId;

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        let decl = Path::new("decls/web-port.toml");

        assert_eq!(
            store.path(Kind::Nic, decl).unwrap(),
            dir.path().join("state").join("nic-web-port.json")
        );
        assert!(store.load::<NicState>(Kind::Nic, decl).unwrap().is_none());

        let state = NicState::seed("5/9".parse::<NicImportId>().unwrap());
        store.save(Kind::Nic, decl, &state).unwrap();
        assert_eq!(store.load::<NicState>(Kind::Nic, decl).unwrap(), Some(state));
        // The VM namespace is separate.
        assert!(store.load::<NicState>(Kind::Vm, decl).unwrap().is_none());

        store.remove(Kind::Nic, decl).unwrap();
        store.remove(Kind::Nic, decl).unwrap();
        assert!(store.load::<NicState>(Kind::Nic, decl).unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let decl = Path::new("app.toml");
        fs::write(store.path(Kind::Vm, decl).unwrap(), "{").unwrap();

        let err = store.load::<NicState>(Kind::Vm, decl).unwrap_err();
        assert!(format!("{err:#}").contains("vm-app.json"), "{err:#}");
    }
}
