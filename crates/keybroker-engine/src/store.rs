//! Store seams used by the engine.
//!
//! `MetadataStore` is the only place that knows the shape of instance and
//! binding records; `SchemaStore` creates and drops the tenant objects.
//! Both are implemented for `StateStore`, which keeps the two halves in one
//! database.

use keybroker_state::{
    BindingInsert, BindingRecord, InstanceDelete, InstanceRecord, ReplicationPolicy, StateResult,
    StateStore,
};

/// A binding as seen by the instance cascade: its id and store user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRef {
    pub binding_id: String,
    pub username: String,
}

pub trait MetadataStore: Clone + Send + Sync + 'static {
    fn instance_exists(&self, instance_id: &str) -> StateResult<bool>;

    /// Insert-if-absent. Returns false if the id is already taken.
    fn insert_instance(&self, record: &InstanceRecord) -> StateResult<bool>;

    fn find_keyspace_by_instance(&self, instance_id: &str) -> StateResult<Option<String>>;

    /// Remove the instance record only if no binding references it.
    fn delete_instance(&self, instance_id: &str) -> StateResult<InstanceDelete>;

    fn binding_exists(&self, binding_id: &str) -> StateResult<bool>;

    /// Insert only if the id is free and the instance record still exists.
    fn insert_binding(&self, record: &BindingRecord) -> StateResult<BindingInsert>;

    /// Username of a binding, only if it belongs to `instance_id`.
    fn find_username_by_binding(
        &self,
        binding_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<String>>;

    /// Snapshot of the instance's bindings, in no particular order.
    fn list_bindings_for_instance(&self, instance_id: &str) -> StateResult<Vec<BindingRef>>;

    fn delete_binding(&self, binding_id: &str) -> StateResult<bool>;
}

pub trait SchemaStore: Clone + Send + Sync + 'static {
    fn create_keyspace(&self, name: &str, replication: &ReplicationPolicy) -> StateResult<()>;

    /// Returns false if the keyspace was already gone.
    fn drop_keyspace_if_exists(&self, name: &str) -> StateResult<bool>;

    /// Create a login user without superuser rights.
    fn create_user(&self, username: &str, password: &str) -> StateResult<()>;

    /// Returns false if the user was already gone.
    fn drop_user_if_exists(&self, username: &str) -> StateResult<bool>;

    fn grant_all(&self, username: &str, keyspace: &str) -> StateResult<()>;
}

impl MetadataStore for StateStore {
    fn instance_exists(&self, instance_id: &str) -> StateResult<bool> {
        StateStore::instance_exists(self, instance_id)
    }

    fn insert_instance(&self, record: &InstanceRecord) -> StateResult<bool> {
        self.insert_instance_if_absent(record)
    }

    fn find_keyspace_by_instance(&self, instance_id: &str) -> StateResult<Option<String>> {
        Ok(self.get_instance(instance_id)?.map(|r| r.keyspace_name))
    }

    fn delete_instance(&self, instance_id: &str) -> StateResult<InstanceDelete> {
        self.delete_instance_if_unbound(instance_id)
    }

    fn binding_exists(&self, binding_id: &str) -> StateResult<bool> {
        StateStore::binding_exists(self, binding_id)
    }

    fn insert_binding(&self, record: &BindingRecord) -> StateResult<BindingInsert> {
        StateStore::insert_binding(self, record)
    }

    fn find_username_by_binding(
        &self,
        binding_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<String>> {
        Ok(self
            .get_binding(binding_id)?
            .filter(|b| b.instance_id == instance_id)
            .map(|b| b.username))
    }

    fn list_bindings_for_instance(&self, instance_id: &str) -> StateResult<Vec<BindingRef>> {
        Ok(StateStore::list_bindings_for_instance(self, instance_id)?
            .into_iter()
            .map(|b| BindingRef {
                binding_id: b.id,
                username: b.username,
            })
            .collect())
    }

    fn delete_binding(&self, binding_id: &str) -> StateResult<bool> {
        StateStore::delete_binding(self, binding_id)
    }
}

impl SchemaStore for StateStore {
    fn create_keyspace(&self, name: &str, replication: &ReplicationPolicy) -> StateResult<()> {
        StateStore::create_keyspace(self, name, replication).map(|_| ())
    }

    fn drop_keyspace_if_exists(&self, name: &str) -> StateResult<bool> {
        StateStore::drop_keyspace_if_exists(self, name)
    }

    fn create_user(&self, username: &str, password: &str) -> StateResult<()> {
        self.create_role(username, password, false).map(|_| ())
    }

    fn drop_user_if_exists(&self, username: &str) -> StateResult<bool> {
        self.drop_role(username)
    }

    fn grant_all(&self, username: &str, keyspace: &str) -> StateResult<()> {
        StateStore::grant_all(self, username, keyspace).map(|_| ())
    }
}
