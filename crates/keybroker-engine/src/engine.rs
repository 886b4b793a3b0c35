//! ProvisioningEngine — the four lifecycle operations.
//!
//! Each operation runs as a sequence of store steps through a `Run`, which
//! moves the blocking store call onto the blocking pool, bounds it with the
//! configured timeout, races it against the caller's `CancelSignal`, and
//! remembers the last committed mutation so an interruption can be reported
//! as "final state unknown" rather than as a clean failure.

use std::time::Duration;

use tracing::{debug, info, warn};

use keybroker_core::config::StoreConfig;
use keybroker_core::random::{self, TOKEN_BYTES};
use keybroker_state::store::epoch_secs;
use keybroker_state::{
    BindingInsert, BindingRecord, InstanceDelete, InstanceRecord, ReplicationPolicy, StateResult,
    StateStore,
};

use crate::cancel::CancelSignal;
use crate::error::{EntityKind, ProvisionError, ProvisionResult};
use crate::store::{MetadataStore, SchemaStore};

/// Prefix of generated keyspace names.
pub const KEYSPACE_PREFIX: &str = "cf";

/// Prefix of generated usernames.
pub const USERNAME_PREFIX: &str = "cf-";

/// Snapshot-and-cascade rounds before a delete gives up on an instance that
/// keeps receiving binds.
const MAX_CASCADE_PASSES: u32 = 4;

/// The engine wired to a single `StateStore` holding schema and metadata.
pub type StoreEngine = ProvisioningEngine<StateStore, StateStore>;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on any single store call.
    pub timeout: Duration,
    /// Applied to every keyspace the engine creates.
    pub replication: ReplicationPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            replication: ReplicationPolicy::simple(3),
        }
    }
}

impl EngineSettings {
    pub fn from_config(store: &StoreConfig) -> Self {
        Self {
            timeout: store.timeout(),
            replication: ReplicationPolicy::simple(store.replication_factor()),
        }
    }
}

/// Credentials handed out by `create_binding`. The connection endpoint is
/// the same for every binding and is added by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingCredentials {
    pub username: String,
    pub password: String,
    pub keyspace: String,
}

pub struct ProvisioningEngine<M, S> {
    metadata: M,
    schema: S,
    settings: EngineSettings,
}

impl StoreEngine {
    /// Engine over one store that serves as both metadata and schema store.
    pub fn for_store(store: StateStore, settings: EngineSettings) -> Self {
        Self::new(store.clone(), store, settings)
    }
}

impl<M: MetadataStore, S: SchemaStore> ProvisioningEngine<M, S> {
    pub fn new(metadata: M, schema: S, settings: EngineSettings) -> Self {
        Self {
            metadata,
            schema,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn run(&self, subject: &str, cancel: CancelSignal) -> Run<M, S> {
        Run {
            metadata: self.metadata.clone(),
            schema: self.schema.clone(),
            subject: subject.to_string(),
            timeout: self.settings.timeout,
            cancel,
            last_write: None,
        }
    }

    /// Provision a keyspace for `instance_id` and record it.
    pub async fn create_instance(
        &self,
        instance_id: &str,
        cancel: CancelSignal,
    ) -> ProvisionResult<()> {
        let mut run = self.run(instance_id, cancel);

        let id = instance_id.to_string();
        if run.query("instance_exists", move |m| m.instance_exists(&id)).await? {
            return Err(ProvisionError::already_exists(EntityKind::Instance, instance_id));
        }

        let keyspace = format!("{KEYSPACE_PREFIX}{}", random::token(TOKEN_BYTES)?);

        let (name, policy) = (keyspace.clone(), self.settings.replication.clone());
        run.schema("create_keyspace", move |s| s.create_keyspace(&name, &policy))
            .await?;

        let record = InstanceRecord {
            id: instance_id.to_string(),
            keyspace_name: keyspace.clone(),
            created_at: epoch_secs(),
        };
        let inserted = run
            .record("insert_instance", move |m| m.insert_instance(&record))
            .await?;

        if !inserted {
            // Another request claimed the id between our check and insert.
            // Nothing references the keyspace we just made.
            warn!(%instance_id, %keyspace, "lost create race, dropping unreferenced keyspace");
            let name = keyspace.clone();
            if let Err(e) = run
                .schema("drop_keyspace", move |s| s.drop_keyspace_if_exists(&name))
                .await
            {
                warn!(%instance_id, %keyspace, error = %e, "keyspace left for reconciliation");
            }
            return Err(ProvisionError::already_exists(EntityKind::Instance, instance_id));
        }

        info!(%instance_id, %keyspace, "instance provisioned");
        Ok(())
    }

    /// Remove an instance, its bindings and its keyspace.
    ///
    /// Bindings are snapshotted first, then removed one by one (user, then
    /// record). The first failure aborts the delete and leaves the instance
    /// record in place so the delete can be retried. The instance record is
    /// only removed once no binding references it; a bind that lands after
    /// the snapshot is picked up by another pass.
    pub async fn delete_instance(
        &self,
        instance_id: &str,
        cancel: CancelSignal,
    ) -> ProvisionResult<()> {
        let mut run = self.run(instance_id, cancel);

        let id = instance_id.to_string();
        if !run.query("instance_exists", move |m| m.instance_exists(&id)).await? {
            return Err(ProvisionError::not_found(EntityKind::Instance, instance_id));
        }

        let id = instance_id.to_string();
        let keyspace = run
            .query("find_keyspace", move |m| m.find_keyspace_by_instance(&id))
            .await?
            .ok_or_else(|| ProvisionError::not_found(EntityKind::Instance, instance_id))?;

        let mut pass = 0;
        loop {
            pass += 1;
            self.cascade_bindings(&mut run, instance_id).await?;

            let id = instance_id.to_string();
            match run.record("delete_instance", move |m| m.delete_instance(&id)).await? {
                InstanceDelete::Deleted => break,
                InstanceDelete::Missing => {
                    debug!(%instance_id, "instance record already removed");
                    break;
                }
                InstanceDelete::StillBound if pass < MAX_CASCADE_PASSES => {
                    debug!(%instance_id, pass, "binding added during delete, cascading again");
                }
                InstanceDelete::StillBound => {
                    return Err(ProvisionError::StoreUnavailable(format!(
                        "instance {instance_id} kept gaining bindings during delete"
                    )));
                }
            }
        }

        let name = keyspace.clone();
        let existed = run
            .schema("drop_keyspace", move |s| s.drop_keyspace_if_exists(&name))
            .await?;
        if !existed {
            debug!(%instance_id, %keyspace, "keyspace already gone");
        }

        info!(%instance_id, %keyspace, "instance deprovisioned");
        Ok(())
    }

    /// Snapshot the instance's bindings and remove each one.
    async fn cascade_bindings(
        &self,
        run: &mut Run<M, S>,
        instance_id: &str,
    ) -> ProvisionResult<()> {
        let id = instance_id.to_string();
        let bindings = run
            .query("list_bindings", move |m| m.list_bindings_for_instance(&id))
            .await?;
        debug!(%instance_id, count = bindings.len(), "cascading to bindings");

        for binding in bindings {
            let cascade = |e: ProvisionError| match e {
                ProvisionError::Cancelled { .. } | ProvisionError::Interrupted { .. } => e,
                other => ProvisionError::CascadeAborted {
                    instance_id: instance_id.to_string(),
                    binding_id: binding.binding_id.clone(),
                    source: Box::new(other),
                },
            };

            let username = binding.username.clone();
            let existed = run
                .schema("drop_user", move |s| s.drop_user_if_exists(&username))
                .await
                .map_err(cascade)?;
            if !existed {
                debug!(binding_id = %binding.binding_id, username = %binding.username, "user already gone");
            }

            let binding_id = binding.binding_id.clone();
            run.record("delete_binding", move |m| m.delete_binding(&binding_id))
                .await
                .map_err(cascade)?;
            debug!(%instance_id, binding_id = %binding.binding_id, "binding removed by cascade");
        }
        Ok(())
    }

    /// Create a user with full access to the instance's keyspace and record
    /// the binding.
    pub async fn create_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
        app_guid: &str,
        cancel: CancelSignal,
    ) -> ProvisionResult<BindingCredentials> {
        let mut run = self.run(binding_id, cancel);

        let id = instance_id.to_string();
        if !run.query("instance_exists", move |m| m.instance_exists(&id)).await? {
            return Err(ProvisionError::not_found(EntityKind::Instance, instance_id));
        }

        let id = binding_id.to_string();
        if run.query("binding_exists", move |m| m.binding_exists(&id)).await? {
            return Err(ProvisionError::already_exists(EntityKind::Binding, binding_id));
        }

        let id = instance_id.to_string();
        let keyspace = run
            .query("find_keyspace", move |m| m.find_keyspace_by_instance(&id))
            .await?
            .ok_or_else(|| ProvisionError::not_found(EntityKind::Instance, instance_id))?;

        let username = format!("{USERNAME_PREFIX}{}", random::token(TOKEN_BYTES)?);
        let password = random::token(TOKEN_BYTES)?;

        let (user, pass) = (username.clone(), password.clone());
        run.schema("create_user", move |s| s.create_user(&user, &pass))
            .await?;

        let (user, ks) = (username.clone(), keyspace.clone());
        run.schema("grant_all", move |s| s.grant_all(&user, &ks))
            .await?;

        let record = BindingRecord {
            id: binding_id.to_string(),
            instance_id: instance_id.to_string(),
            app_guid: app_guid.to_string(),
            username: username.clone(),
            password: password.clone(),
            created_at: epoch_secs(),
        };
        let outcome = run
            .record("insert_binding", move |m| m.insert_binding(&record))
            .await?;

        let rejected = match outcome {
            BindingInsert::Inserted => None,
            BindingInsert::IdTaken => {
                warn!(%binding_id, %username, "lost bind race, dropping unreferenced user");
                Some(ProvisionError::already_exists(EntityKind::Binding, binding_id))
            }
            BindingInsert::InstanceMissing => {
                warn!(%instance_id, %binding_id, %username, "instance deleted during bind, dropping unreferenced user");
                Some(ProvisionError::not_found(EntityKind::Instance, instance_id))
            }
        };
        if let Some(err) = rejected {
            // Nothing references the user we just made.
            let user = username.clone();
            if let Err(e) = run
                .schema("drop_user", move |s| s.drop_user_if_exists(&user))
                .await
            {
                warn!(%binding_id, %username, error = %e, "user left for reconciliation");
            }
            return Err(err);
        }

        info!(%instance_id, %binding_id, %username, %keyspace, "binding created");
        Ok(BindingCredentials {
            username,
            password,
            keyspace,
        })
    }

    /// Drop the binding's user and its record.
    pub async fn delete_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
        cancel: CancelSignal,
    ) -> ProvisionResult<()> {
        let mut run = self.run(binding_id, cancel);

        let id = instance_id.to_string();
        if !run.query("instance_exists", move |m| m.instance_exists(&id)).await? {
            return Err(ProvisionError::not_found(EntityKind::Instance, instance_id));
        }

        let (bid, iid) = (binding_id.to_string(), instance_id.to_string());
        let username = run
            .query("find_username", move |m| m.find_username_by_binding(&bid, &iid))
            .await?
            .ok_or_else(|| ProvisionError::not_found(EntityKind::Binding, binding_id))?;

        let user = username.clone();
        if !run.schema("drop_user", move |s| s.drop_user_if_exists(&user)).await? {
            debug!(%binding_id, %username, "user already gone");
        }

        let id = binding_id.to_string();
        run.record("delete_binding", move |m| m.delete_binding(&id))
            .await?;

        info!(%instance_id, %binding_id, %username, "binding deleted");
        Ok(())
    }
}

/// One operation's view of the stores.
struct Run<M, S> {
    metadata: M,
    schema: S,
    /// Id reported in cancellation errors.
    subject: String,
    timeout: Duration,
    cancel: CancelSignal,
    last_write: Option<&'static str>,
}

impl<M: MetadataStore, S: SchemaStore> Run<M, S> {
    /// Metadata read.
    async fn query<T, F>(&mut self, step: &'static str, f: F) -> ProvisionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&M) -> StateResult<T> + Send + 'static,
    {
        let store = self.metadata.clone();
        self.exec(step, false, move || f(&store)).await
    }

    /// Metadata write.
    async fn record<T, F>(&mut self, step: &'static str, f: F) -> ProvisionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&M) -> StateResult<T> + Send + 'static,
    {
        let store = self.metadata.clone();
        self.exec(step, true, move || f(&store)).await
    }

    /// Schema write.
    async fn schema<T, F>(&mut self, step: &'static str, f: F) -> ProvisionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StateResult<T> + Send + 'static,
    {
        let store = self.schema.clone();
        self.exec(step, true, move || f(&store)).await
    }

    async fn exec<T, F>(&mut self, step: &'static str, mutates: bool, f: F) -> ProvisionResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StateResult<T> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(self.halted(None));
        }

        let timeout = self.timeout;
        let task = tokio::task::spawn_blocking(f);
        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, task) => Some(res),
            _ = self.cancel.cancelled() => None,
        };

        let Some(res) = outcome else {
            // The call keeps running on the blocking pool; a write may
            // still land.
            return Err(self.halted(mutates.then_some(step)));
        };

        match res {
            Err(_) => {
                warn!(subject = %self.subject, step, ?timeout, "store call timed out");
                Err(ProvisionError::Timeout {
                    step,
                    after: timeout,
                })
            }
            Ok(Err(join)) => Err(ProvisionError::StoreUnavailable(format!("{step}: {join}"))),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Ok(Ok(value))) => {
                if mutates {
                    self.last_write = Some(step);
                }
                Ok(value)
            }
        }
    }

    fn halted(&self, in_flight: Option<&'static str>) -> ProvisionError {
        match in_flight.or(self.last_write) {
            None => ProvisionError::Cancelled {
                id: self.subject.clone(),
            },
            Some(step) => ProvisionError::Interrupted {
                id: self.subject.clone(),
                step,
            },
        }
    }
}
