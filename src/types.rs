//! NewType wrappers for strong typing throughout watchpost.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a service name where a check identity is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Stable identity of a registered check (e.g., "billing::ping-example").
    ///
    /// Built from the declaring namespace and the check's service name so
    /// that same-named checks in different namespaces stay distinct. This is
    /// the value used in execution keys and error records.
    CheckId
);

newtype_string!(
    /// Service name as shown by the monitoring backend.
    ///
    /// This is wire-visible. A result may extend it with a name suffix to
    /// create several services from one check.
    ServiceName
);

newtype_string!(
    /// RFC1123 hostname used as the Checkmk piggyback host.
    Hostname
);

impl CheckId {
    /// Compose a check identity from a namespace and a check name.
    ///
    /// An empty namespace yields the bare name.
    pub fn qualified(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self::new(name)
        } else {
            Self(format!("{}::{}", namespace, name))
        }
    }
}
