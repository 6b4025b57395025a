pub mod hash;
pub mod normalizer;

pub use normalizer::{
    credential_refs, portable_definition, substitute_credentials, CredentialKeyMap,
    CredentialRef, CredentialSubstitutions, NormalizeError, Substitution,
};

use flowops_shared::ContentHash;
use serde_json::Value;

/// Canonical identity of a workflow definition.
///
/// `keys` maps the environment's physical credential ids to logical keys so
/// that the same workflow hashes identically in every environment.
pub fn content_hash(definition: &Value, keys: &CredentialKeyMap) -> Result<ContentHash, NormalizeError> {
    let normalized = normalizer::normalize(definition, keys)?;
    Ok(hash::hash_normalized(&normalized))
}
