//! Identity types for Foreman entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ENTITY ID TYPE SYSTEM
// ============================================================================

/// Trait for type-safe entity IDs.
///
/// Each entity type gets its own newtype so a `TaskId` can never be passed
/// where a `WorkerId` is expected.
pub trait EntityIdType:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Hash
    + fmt::Debug
    + fmt::Display
    + FromStr
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The name of the entity type (e.g., "project", "task").
    const ENTITY_NAME: &'static str;

    /// Create a new ID from a UUID.
    fn new(uuid: Uuid) -> Self;

    /// Get the underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// Create a nil (all zeros) ID.
    fn nil() -> Self {
        Self::new(Uuid::nil())
    }

    /// Create a new timestamp-sortable UUIDv7 ID.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Create a new random UUIDv4 ID.
    fn new_v4() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Error type for parsing entity IDs from strings.
#[derive(Debug, Clone)]
pub struct EntityIdParseError {
    pub entity_name: &'static str,
    pub input: String,
    pub source: uuid::Error,
}

impl fmt::Display for EntityIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to parse {} ID from '{}': {}",
            self.entity_name, self.input, self.source
        )
    }
}

impl std::error::Error for EntityIdParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Macro to define a type-safe entity ID newtype.
macro_rules! define_entity_id {
    ($name:ident, $entity:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            const ENTITY_NAME: &'static str = $entity;

            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = EntityIdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self::new)
                    .map_err(|e| EntityIdParseError {
                        entity_name: Self::ENTITY_NAME,
                        input: s.to_string(),
                        source: e,
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self::new(uuid)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                // Serialize transparently as UUID string
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Uuid::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

// ============================================================================
// ENTITY ID TYPES
// ============================================================================

define_entity_id!(ProjectId, "project", "Type-safe ID for project entities.");
define_entity_id!(PhaseId, "phase", "Type-safe ID for phase entities.");
define_entity_id!(TaskId, "task", "Type-safe ID for task entities.");
define_entity_id!(WorkerId, "worker", "Type-safe ID for worker entities.");
define_entity_id!(
    TokenId,
    "registration_token",
    "Type-safe ID for registration token entities."
);
define_entity_id!(
    TransitionId,
    "transition",
    "Type-safe ID for transition record entities."
);

// ============================================================================
// OTHER IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 digest of a secret, hex-encoded.
///
/// Registration tokens and worker secrets are stored only as digests; the
/// plaintext is returned to the caller exactly once.
pub type SecretDigest = String;

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

/// Compute the hex-encoded SHA-256 digest of a secret string.
pub fn secret_digest(secret: &str) -> SecretDigest {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let result = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in result {
        use fmt::Write;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Generate a fresh opaque secret string.
///
/// Two concatenated v4 UUIDs, 64 hex characters of entropy.
pub fn generate_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_type_safety() {
        let project_id = ProjectId::now_v7();
        let task_id = TaskId::now_v7();

        // This would not compile if uncommented:
        // let _: ProjectId = task_id;

        assert_ne!(project_id.as_uuid(), task_id.as_uuid());
    }

    #[test]
    fn test_entity_id_display() {
        let id = TaskId::new(Uuid::nil());
        assert_eq!(
            format!("{:?}", id),
            "TaskId(00000000-0000-0000-0000-000000000000)"
        );
        assert_eq!(format!("{}", id), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_entity_id_from_str() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id: TaskId = uuid_str.parse().expect("valid UUID should parse");
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_entity_id_parse_error() {
        let result: Result<WorkerId, _> = "invalid".parse();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.entity_name, "worker");
        assert_eq!(err.input, "invalid");
    }

    #[test]
    fn test_entity_id_serde() {
        let id = TaskId::now_v7();
        let json = serde_json::to_string(&id).expect("serialization should succeed");
        // Should serialize as UUID string (not wrapped in object)
        assert!(json.starts_with('"'));
        assert!(json.ends_with('"'));

        let deserialized: TaskId =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_v7_ids_are_time_ordered() {
        let a = TaskId::now_v7();
        let b = TaskId::now_v7();
        assert!(a <= b);
    }

    #[test]
    fn test_secret_digest_is_stable() {
        let d1 = secret_digest("hunter2");
        let d2 = secret_digest("hunter2");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert_ne!(d1, secret_digest("hunter3"));
    }

    #[test]
    fn test_generate_secret_is_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
