//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every schedulable node carries a strongly-typed ID generated at
//! construction. IDs use UUID v7 (time-ordered) so checkpoint directory
//! names sort roughly by creation time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }

            /// Parse an identifier from its hyphenated text form.
            ///
            /// # Errors
            ///
            /// Returns [`uuid::Error`] if the text is not a valid UUID.
            pub fn parse(text: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(text).map(Self)
            }

            /// Compact form without hyphens, used in directory names.
            pub fn simple(&self) -> String {
                self.0.simple().to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a schedulable node (leaf or scheduler).
    NodeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
        assert_ne!(a.into_inner(), Uuid::nil());
    }

    #[test]
    fn id_roundtrip_text() {
        let original = NodeId::new();
        let parsed = NodeId::parse(&original.to_string()).ok();
        assert_eq!(parsed, Some(original));
    }

    #[test]
    fn simple_form_has_no_hyphens() {
        let id = NodeId::new();
        assert!(!id.simple().contains('-'));
        assert_eq!(id.simple().len(), 32);
    }
}
