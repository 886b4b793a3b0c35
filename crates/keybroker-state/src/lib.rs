//! keybroker-state — the multi-tenant store the broker provisions into.
//!
//! Backed by [redb](https://docs.rs/redb). One database file holds both
//! halves of the store:
//!
//! - the **schema catalog**: keyspaces, roles and grants, i.e. the tenant
//!   objects applications are given access to;
//! - the broker's own **metadata**: `instances` and `bindings` records that
//!   track what the broker provisioned.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutation runs in its own write transaction; redb serializes
//! writers, so the conditional inserts (`insert_*_if_absent`,
//! `create_keyspace`, `create_role`) are atomic check-and-set operations.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
