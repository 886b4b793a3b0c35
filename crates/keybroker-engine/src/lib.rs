//! keybroker-engine — the provisioning engine.
//!
//! Turns the four lifecycle requests (create/delete instance, create/delete
//! binding) into store-side schema objects (keyspace, role, grant) and
//! metadata records (instance, binding).
//!
//! # Ordering
//!
//! ```text
//! create:  schema object ──▶ metadata record     (record ⇒ object)
//! delete:  metadata record ──▶ schema object     (record ⇒ object)
//! ```
//!
//! A crash between the two steps leaves an orphaned schema object, which
//! `reconcile` can find and purge offline, never a record pointing at
//! nothing.
//!
//! # Concurrency
//!
//! The engine holds no locks. Upfront existence checks are a fast path;
//! the metadata store's insert-if-absent decides `AlreadyExists`. Every
//! store call runs on the blocking pool under the configured timeout and
//! races the caller's `CancelSignal`.

pub mod cancel;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod store;

pub use cancel::CancelSignal;
pub use engine::{BindingCredentials, EngineSettings, ProvisioningEngine, StoreEngine};
pub use error::{EntityKind, ProvisionError, ProvisionResult};
pub use reconcile::{OrphanReport, find_orphans, purge_orphans};
pub use store::{BindingRef, MetadataStore, SchemaStore};
