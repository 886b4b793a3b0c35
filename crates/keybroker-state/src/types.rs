//! Record types for the keybroker state store.
//!
//! Schema-side records (keyspaces, roles, grants) describe the tenant
//! objects; metadata records (instances, bindings) describe what the broker
//! provisioned. All types are serializable to/from JSON for storage in redb
//! tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Caller-supplied identifier of a service instance.
pub type InstanceId = String;

/// Caller-supplied identifier of a service binding.
pub type BindingId = String;

/// Longest accepted keyspace or role name.
pub const MAX_IDENTIFIER_LEN: usize = 48;

// ── Schema catalog ────────────────────────────────────────────────

/// Replication settings applied when a keyspace is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationPolicy {
    /// Placement strategy, e.g. `SimpleStrategy`.
    pub class: String,
    pub replication_factor: u32,
}

impl ReplicationPolicy {
    pub fn simple(replication_factor: u32) -> Self {
        Self {
            class: "SimpleStrategy".to_string(),
            replication_factor,
        }
    }
}

/// A tenant keyspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyspaceRecord {
    pub name: String,
    pub replication: ReplicationPolicy,
    /// Unix timestamp (seconds) when this keyspace was created.
    pub created_at: u64,
}

/// A login role. Only a salted digest of the password is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleRecord {
    pub name: String,
    pub salt: String,
    /// Hex SHA-256 of `salt || password`.
    pub password_hash: String,
    pub superuser: bool,
    pub created_at: u64,
}

impl RoleRecord {
    pub fn hash_password(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self, password: &str) -> bool {
        let candidate = Self::hash_password(&self.salt, password);
        // Both are hex SHA-256, so lengths match unless the record is corrupt.
        candidate.len() == self.password_hash.len()
            && bool::from(candidate.as_bytes().ct_eq(self.password_hash.as_bytes()))
    }
}

/// Full permissions for one role on one keyspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantRecord {
    pub role: String,
    pub keyspace: String,
    pub granted_at: u64,
}

impl GrantRecord {
    /// Build the composite key for the grants table.
    pub fn table_key(&self) -> String {
        grant_key(&self.role, &self.keyspace)
    }
}

pub(crate) fn grant_key(role: &str, keyspace: &str) -> String {
    format!("{role}/{keyspace}")
}

// ── Broker metadata ───────────────────────────────────────────────

/// A provisioned service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub keyspace_name: String,
    pub created_at: u64,
}

/// A provisioned service binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingRecord {
    pub id: BindingId,
    pub instance_id: InstanceId,
    /// Informational only, never used for lookups.
    pub app_guid: String,
    pub username: String,
    pub password: String,
    pub created_at: u64,
}

/// Outcome of a binding insert, decided in the same transaction that
/// writes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingInsert {
    Inserted,
    /// Another binding already holds this id.
    IdTaken,
    /// The referenced instance record is gone.
    InstanceMissing,
}

/// Outcome of removing an instance record that must have no bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceDelete {
    Deleted,
    Missing,
    /// A binding still references the instance; nothing was removed.
    StillBound,
}

/// Row counts per table, used by the offline tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub keyspaces: u64,
    pub roles: u64,
    pub grants: u64,
    pub instances: u64,
    pub bindings: u64,
}

/// Check a keyspace or role name: 1..=48 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("cf0a1b2c"));
        assert!(is_valid_identifier("cf-user_1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("quote'd"));
        assert!(!is_valid_identifier("a/b"));
        assert!(!is_valid_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)));
    }

    #[test]
    fn role_password_verification() {
        let role = RoleRecord {
            name: "cf-app".to_string(),
            salt: "abcd".to_string(),
            password_hash: RoleRecord::hash_password("abcd", "secret"),
            superuser: false,
            created_at: 1000,
        };
        assert!(role.verify("secret"));
        assert!(!role.verify("Secret"));
        assert!(!role.verify(""));
        assert_ne!(role.password_hash, "secret");
    }

    #[test]
    fn corrupt_hash_never_verifies() {
        let role = RoleRecord {
            name: "cf-app".to_string(),
            salt: "abcd".to_string(),
            password_hash: "short".to_string(),
            superuser: false,
            created_at: 1000,
        };
        assert!(!role.verify("secret"));
    }
}
