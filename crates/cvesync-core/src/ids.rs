//! Branded ID newtypes.
//!
//! Resource ids come from the server (`CVE-2024-0001`, comment UUIDs) and are
//! wrapped as-is. Correlation ids are generated locally as UUID v7 so that
//! request ordering is visible in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a server-side resource (CVE record, comment).
    ResourceId
}

branded_id! {
    /// Token attached to an outbound request so its acknowledgement can be matched.
    CorrelationId
}

branded_id! {
    /// Identifier of a user watching a resource.
    SubscriberId
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_is_uuid() {
        let id = CorrelationId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn resource_id_keeps_server_value() {
        let id = ResourceId::from("CVE-2024-0001");
        assert_eq!(id.as_str(), "CVE-2024-0001");
        assert_eq!(id.to_string(), "CVE-2024-0001");
        assert_eq!(&*id, "CVE-2024-0001");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ResourceId::from("CVE-2024-0001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"CVE-2024-0001\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_string() {
        let id = SubscriberId::from("u1");
        let s: String = id.into();
        assert_eq!(s, "u1");
    }
}
