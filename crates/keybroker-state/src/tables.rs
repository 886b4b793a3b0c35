//! redb table definitions for the keybroker state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Keyspaces keyed by keyspace name.
pub const KEYSPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("keyspaces");

/// Roles (store users) keyed by role name.
pub const ROLES: TableDefinition<&str, &[u8]> = TableDefinition::new("roles");

/// Grants keyed by `{role}/{keyspace}`. Both halves are validated identifiers.
pub const GRANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("grants");

/// Service instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Service binding records keyed by binding id.
pub const BINDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bindings");
