//! Offline orphan detection.
//!
//! A crash or interrupted request can leave a keyspace or user that no
//! record points at, since objects are created before their records and
//! dropped after them. Run against a store with no broker serving from it:
//! an in-flight create looks exactly like an orphan.

use std::collections::HashSet;

use tracing::{info, warn};

use keybroker_state::{StateResult, StateStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Keyspaces no instance record names.
    pub keyspaces: Vec<String>,
    /// Non-superuser roles no binding record names.
    pub roles: Vec<String>,
    /// Binding records whose instance record is gone.
    pub bindings: Vec<String>,
}

impl OrphanReport {
    pub fn is_empty(&self) -> bool {
        self.keyspaces.is_empty() && self.roles.is_empty() && self.bindings.is_empty()
    }

    pub fn total(&self) -> usize {
        self.keyspaces.len() + self.roles.len() + self.bindings.len()
    }
}

pub fn find_orphans(store: &StateStore) -> StateResult<OrphanReport> {
    let instances = store.list_instances()?;
    let bindings = store.list_bindings()?;

    let instance_ids: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
    let referenced_keyspaces: HashSet<&str> =
        instances.iter().map(|i| i.keyspace_name.as_str()).collect();
    let referenced_users: HashSet<&str> = bindings.iter().map(|b| b.username.as_str()).collect();

    let mut report = OrphanReport {
        keyspaces: store
            .list_keyspaces()?
            .into_iter()
            .filter(|k| !referenced_keyspaces.contains(k.name.as_str()))
            .map(|k| k.name)
            .collect(),
        roles: store
            .list_roles()?
            .into_iter()
            .filter(|r| !r.superuser && !referenced_users.contains(r.name.as_str()))
            .map(|r| r.name)
            .collect(),
        bindings: bindings
            .iter()
            .filter(|b| !instance_ids.contains(b.instance_id.as_str()))
            .map(|b| b.id.clone())
            .collect(),
    };
    report.keyspaces.sort();
    report.roles.sort();
    report.bindings.sort();
    Ok(report)
}

/// Remove everything in `report`. Orphaned bindings take their user with
/// them. Returns the number of objects actually removed.
pub fn purge_orphans(store: &StateStore, report: &OrphanReport) -> StateResult<usize> {
    let mut removed = 0;

    for binding_id in &report.bindings {
        if let Some(binding) = store.get_binding(binding_id)? {
            store.drop_role(&binding.username)?;
        }
        if store.delete_binding(binding_id)? {
            info!(%binding_id, "purged orphaned binding");
            removed += 1;
        }
    }

    for role in &report.roles {
        if store.drop_role(role)? {
            info!(%role, "purged orphaned role");
            removed += 1;
        }
    }

    for keyspace in &report.keyspaces {
        if store.drop_keyspace_if_exists(keyspace)? {
            info!(%keyspace, "purged orphaned keyspace");
            removed += 1;
        } else {
            warn!(%keyspace, "orphaned keyspace already gone");
        }
    }

    Ok(removed)
}
