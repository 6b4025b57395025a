pub mod locks;
pub mod preflight;

pub use locks::KeyedLocks;
pub use preflight::{EvaluatedPreflight, PreflightError, PreflightResolver, SourceWorkflow};

use std::collections::HashMap;
use uuid::Uuid;

use crate::identity::CredentialKeyMap;
use crate::store::{CredentialMappingStore, StoreResult};

/// Physical → logical lookup for one environment, built from its mappings
pub async fn credential_key_map(
    store: &dyn CredentialMappingStore,
    tenant_id: Uuid,
    environment_id: Uuid,
) -> StoreResult<CredentialKeyMap> {
    let logical: HashMap<Uuid, String> = store
        .list_logical_credentials(tenant_id)
        .await?
        .into_iter()
        .map(|c| (c.id, c.key))
        .collect();

    let mut keys = CredentialKeyMap::new();
    for mapping in store.list_mappings(tenant_id, environment_id).await? {
        if let Some(key) = logical.get(&mapping.logical_credential_id) {
            keys.insert(mapping.physical_type, mapping.physical_credential_id, key.clone());
        }
    }
    Ok(keys)
}

/// Display name part of a logical key (`"slackApi:notifications"` → `"notifications"`)
pub fn logical_name(key: &str) -> &str {
    key.split_once(':').map(|(_, name)| name).unwrap_or(key)
}
