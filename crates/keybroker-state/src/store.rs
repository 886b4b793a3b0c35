//! StateStore — redb-backed persistence for keybroker.
//!
//! Provides typed operations over the schema catalog (keyspaces, roles,
//! grants) and the broker metadata (instances, bindings). All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use keybroker_core::random;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const SALT_BYTES: usize = 8;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [KEYSPACES, ROLES, GRANTS, INSTANCES, BINDINGS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Row counts for every table.
    pub fn summary(&self) -> StateResult<StoreSummary> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let count = |def: RecordTable| -> StateResult<u64> {
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            Ok(table.iter().map_err(map_err!(Read))?.count() as u64)
        };
        Ok(StoreSummary {
            keyspaces: count(KEYSPACES)?,
            roles: count(ROLES)?,
            grants: count(GRANTS)?,
            instances: count(INSTANCES)?,
            bindings: count(BINDINGS)?,
        })
    }

    // ── Keyspaces ──────────────────────────────────────────────────

    /// Create a keyspace. Fails with `Conflict` if the name is taken.
    pub fn create_keyspace(
        &self,
        name: &str,
        replication: &ReplicationPolicy,
    ) -> StateResult<KeyspaceRecord> {
        validate_identifier(name)?;
        let record = KeyspaceRecord {
            name: name.to_string(),
            replication: replication.clone(),
            created_at: epoch_secs(),
        };
        if !self.insert_if_absent(KEYSPACES, name, &record)? {
            return Err(StateError::Conflict(format!("keyspace {name}")));
        }
        debug!(keyspace = %name, rf = replication.replication_factor, "keyspace created");
        Ok(record)
    }

    pub fn get_keyspace(&self, name: &str) -> StateResult<Option<KeyspaceRecord>> {
        self.get_record(KEYSPACES, name)
    }

    pub fn keyspace_exists(&self, name: &str) -> StateResult<bool> {
        self.contains(KEYSPACES, name)
    }

    pub fn list_keyspaces(&self) -> StateResult<Vec<KeyspaceRecord>> {
        self.list_records(KEYSPACES)
    }

    /// Drop a keyspace and every grant on it. Returns true if it existed.
    pub fn drop_keyspace_if_exists(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let revoked;
        {
            let mut keyspaces = txn.open_table(KEYSPACES).map_err(map_err!(Table))?;
            existed = keyspaces.remove(name).map_err(map_err!(Write))?.is_some();

            let mut grants = txn.open_table(GRANTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in grants.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let grant: GrantRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if grant.keyspace == name {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                grants.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            revoked = keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(keyspace = %name, existed, revoked, "keyspace dropped");
        Ok(existed)
    }

    // ── Roles ──────────────────────────────────────────────────────

    /// Create a login role. Fails with `Conflict` if the name is taken.
    pub fn create_role(&self, name: &str, password: &str, superuser: bool) -> StateResult<RoleRecord> {
        validate_identifier(name)?;
        let salt = random::token(SALT_BYTES)?;
        let record = RoleRecord {
            name: name.to_string(),
            password_hash: RoleRecord::hash_password(&salt, password),
            salt,
            superuser,
            created_at: epoch_secs(),
        };
        if !self.insert_if_absent(ROLES, name, &record)? {
            return Err(StateError::Conflict(format!("role {name}")));
        }
        debug!(role = %name, superuser, "role created");
        Ok(record)
    }

    pub fn get_role(&self, name: &str) -> StateResult<Option<RoleRecord>> {
        self.get_record(ROLES, name)
    }

    pub fn role_exists(&self, name: &str) -> StateResult<bool> {
        self.contains(ROLES, name)
    }

    pub fn list_roles(&self) -> StateResult<Vec<RoleRecord>> {
        self.list_records(ROLES)
    }

    /// Drop a role and every grant it holds. Returns true if it existed.
    pub fn drop_role(&self, name: &str) -> StateResult<bool> {
        let prefix = grant_key(name, "");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut roles = txn.open_table(ROLES).map_err(map_err!(Table))?;
            existed = roles.remove(name).map_err(map_err!(Write))?.is_some();

            let mut grants = txn.open_table(GRANTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in grants.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                grants.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(role = %name, existed, "role dropped");
        Ok(existed)
    }

    /// Check a role's password. Unknown roles never authenticate.
    pub fn authenticate(&self, name: &str, password: &str) -> StateResult<bool> {
        Ok(self
            .get_role(name)?
            .is_some_and(|role| role.verify(password)))
    }

    // ── Grants ─────────────────────────────────────────────────────

    /// Grant a role full permissions on one keyspace.
    ///
    /// Both must exist; the check and the write share one transaction.
    pub fn grant_all(&self, role: &str, keyspace: &str) -> StateResult<GrantRecord> {
        let grant = GrantRecord {
            role: role.to_string(),
            keyspace: keyspace.to_string(),
            granted_at: epoch_secs(),
        };
        let key = grant.table_key();
        let value = serde_json::to_vec(&grant).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let roles = txn.open_table(ROLES).map_err(map_err!(Table))?;
            if roles.get(role).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("role {role}")));
            }
            let keyspaces = txn.open_table(KEYSPACES).map_err(map_err!(Table))?;
            if keyspaces.get(keyspace).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("keyspace {keyspace}")));
            }
            let mut grants = txn.open_table(GRANTS).map_err(map_err!(Table))?;
            grants
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%role, %keyspace, "granted all permissions");
        Ok(grant)
    }

    pub fn list_grants_for_role(&self, role: &str) -> StateResult<Vec<GrantRecord>> {
        Ok(self
            .list_records::<GrantRecord>(GRANTS)?
            .into_iter()
            .filter(|g| g.role == role)
            .collect())
    }

    /// Whether `role` may read and write `keyspace`.
    pub fn has_access(&self, role: &str, keyspace: &str) -> StateResult<bool> {
        match self.get_role(role)? {
            None => Ok(false),
            Some(r) if r.superuser => Ok(true),
            Some(_) => self.contains(GRANTS, &grant_key(role, keyspace)),
        }
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn instance_exists(&self, id: &str) -> StateResult<bool> {
        self.contains(INSTANCES, id)
    }

    /// Insert an instance record unless one with the same id exists.
    /// Returns false when the id was already taken.
    pub fn insert_instance_if_absent(&self, record: &InstanceRecord) -> StateResult<bool> {
        let inserted = self.insert_if_absent(INSTANCES, &record.id, record)?;
        debug!(instance_id = %record.id, inserted, "instance record insert");
        Ok(inserted)
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_record(INSTANCES, id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list_records(INSTANCES)
    }

    /// Delete an instance record unless a binding still references it.
    ///
    /// The binding scan and the removal share one write transaction, so a
    /// concurrent bind either lands before (and is reported) or sees the
    /// instance gone.
    pub fn delete_instance_if_unbound(&self, id: &str) -> StateResult<InstanceDelete> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            let mut bound = false;
            for entry in bindings.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let binding: BindingRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if binding.instance_id == id {
                    bound = true;
                    break;
                }
            }

            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            outcome = if bound {
                InstanceDelete::StillBound
            } else if instances.remove(id).map_err(map_err!(Write))?.is_some() {
                InstanceDelete::Deleted
            } else {
                InstanceDelete::Missing
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %id, ?outcome, "instance record delete");
        Ok(outcome)
    }

    /// Delete an instance record without looking at its bindings.
    /// Offline tooling only; the broker goes through
    /// `delete_instance_if_unbound`.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_record(INSTANCES, id)?;
        debug!(instance_id = %id, existed, "instance record deleted");
        Ok(existed)
    }

    // ── Bindings ───────────────────────────────────────────────────

    pub fn binding_exists(&self, id: &str) -> StateResult<bool> {
        self.contains(BINDINGS, id)
    }

    /// Insert a binding record if its id is free and its instance record
    /// still exists. Both checks and the write share one transaction.
    pub fn insert_binding(&self, record: &BindingRecord) -> StateResult<BindingInsert> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            outcome = if bindings.get(record.id.as_str()).map_err(map_err!(Read))?.is_some() {
                BindingInsert::IdTaken
            } else if instances
                .get(record.instance_id.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                BindingInsert::InstanceMissing
            } else {
                bindings
                    .insert(record.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                BindingInsert::Inserted
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(binding_id = %record.id, instance_id = %record.instance_id, ?outcome, "binding record insert");
        Ok(outcome)
    }

    pub fn get_binding(&self, id: &str) -> StateResult<Option<BindingRecord>> {
        self.get_record(BINDINGS, id)
    }

    pub fn list_bindings(&self) -> StateResult<Vec<BindingRecord>> {
        self.list_records(BINDINGS)
    }

    /// All bindings that reference the given instance.
    pub fn list_bindings_for_instance(&self, instance_id: &str) -> StateResult<Vec<BindingRecord>> {
        Ok(self
            .list_bindings()?
            .into_iter()
            .filter(|b| b.instance_id == instance_id)
            .collect())
    }

    /// Delete a binding record. Returns true if it existed.
    pub fn delete_binding(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_record(BINDINGS, id)?;
        debug!(binding_id = %id, existed, "binding record deleted");
        Ok(existed)
    }

    // ── Record helpers ─────────────────────────────────────────────

    fn contains(&self, def: RecordTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(table.get(key).map_err(map_err!(Read))?.is_some())
    }

    fn get_record<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Atomic insert-if-absent. Returns true if the record was written.
    fn insert_if_absent<T: Serialize>(&self, def: RecordTable, key: &str, record: &T) -> StateResult<bool> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            inserted = table.get(key).map_err(map_err!(Read))?.is_none();
            if inserted {
                table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    fn remove_record(&self, def: RecordTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

fn validate_identifier(name: &str) -> StateResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
