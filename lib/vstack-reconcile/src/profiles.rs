// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The OS type and profile catalog.

use serde::Serialize;

use vstack_client::api::{self, RpcMethod};
use vstack_client::Client;

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OsType {
    pub id: i64,
    pub name: String,
    pub profiles: Vec<Profile>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Minimum root disk size, as reported by the platform.
    pub min_size: i64,
}

/// Lists the OS types the platform offers, ordered by id, each with its
/// profiles in the order the platform reports them.
pub async fn list_profiles(client: &Client) -> Result<Vec<OsType>, Error> {
    let catalog = client
        .invoke::<api::VmProfiles>(&api::NoParams::default())
        .await
        .map_err(Error::remote(api::VmProfiles::NAME, "profile catalog"))?
        .unwrap_or_default();

    let mut os_types: Vec<OsType> = catalog
        .into_values()
        .map(|os| OsType {
            id: os.id,
            name: os.name,
            profiles: os
                .profiles
                .into_iter()
                .map(|p| Profile {
                    id: p.id,
                    name: p.name,
                    description: p.description,
                    min_size: p.min_size,
                })
                .collect(),
        })
        .collect();
    os_types.sort_by_key(|os| os.id);
    Ok(os_types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mock_client;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn catalog_is_ordered_by_os_type() {
        let (mock, client) = mock_client();
        let mut catalog = BTreeMap::new();
        catalog.insert(
            "a-linux".to_string(),
            api::OsTypeDescription {
                id: 2,
                name: "Linux".to_string(),
                profiles: vec![api::ProfileDescription {
                    id: 20,
                    name: "ubuntu-22.04".to_string(),
                    description: "Ubuntu".to_string(),
                    min_size: 8,
                }],
            },
        );
        catalog.insert(
            "b-bsd".to_string(),
            api::OsTypeDescription {
                id: 1,
                name: "BSD".to_string(),
                profiles: Vec::new(),
            },
        );
        mock.set_profiles(catalog);

        let os_types = list_profiles(&client).await.unwrap();
        let ids: Vec<_> = os_types.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(os_types[1].profiles[0].name, "ubuntu-22.04");
        assert_eq!(mock.methods(), vec!["vm-profiles"]);
    }

    #[tokio::test]
    async fn empty_catalog() {
        let (_mock, client) = mock_client();
        assert!(list_profiles(&client).await.unwrap().is_empty());
    }
}
