//! Storage key derivation for the shared database and side channel.
//!
//! Every persistent artifact a client group shares hangs off one storage
//! prefix derived from `(persistenceKey, projectId[, databaseId])`. Dots
//! are unambiguous separators because project ids are DNS labels.

use crate::core::{ClientId, DatabaseInfo};

const PREFIX_ROOT: &str = "firestore";
const MAIN_DATABASE: &str = "main";
const ZOMBIE_KEY_PREFIX: &str = "firestore_zombie";

/// `firestore/<persistenceKey>/<projectId[.databaseId]>/`
pub(crate) fn storage_prefix(info: &DatabaseInfo) -> String {
    let mut database_segment = info.project_id.as_str().to_string();
    if let Some(database_id) = &info.database_id {
        database_segment.push('.');
        database_segment.push_str(database_id.as_str());
    }
    format!(
        "{PREFIX_ROOT}/{}/{database_segment}/",
        info.persistence_key.as_str()
    )
}

/// Name of the shared transactional database under a prefix.
pub(crate) fn database_name(info: &DatabaseInfo) -> String {
    format!("{}{MAIN_DATABASE}", storage_prefix(info))
}

/// Side-channel key marking `client_id` as terminating.
pub(crate) fn zombie_key(storage_prefix: &str, client_id: &ClientId) -> String {
    format!("{ZOMBIE_KEY_PREFIX}_{storage_prefix}_{client_id}")
}
