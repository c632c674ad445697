//! Branded ID newtypes for type safety.
//!
//! Two identifiers travel on the wire:
//!
//! - [`SessionHash`]: generated once per client session, attached to every
//!   outbound message so the service can group them.
//! - [`EventId`]: assigned by the service when a job joins the queue under the
//!   shared-stream transport; the multiplexing key for inbound messages.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const SESSION_HASH_LEN: usize = 11;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
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
    };
}

branded_id!(
    /// Client-generated correlation id shared by every job of one client session.
    SessionHash
);

branded_id!(
    /// Server-assigned correlator for all messages of one queued job.
    EventId
);

impl SessionHash {
    /// Generate a fresh random hash (lowercase base-36).
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let hash = (0..SESSION_HASH_LEN)
            .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
            .collect();
        Self(hash)
    }
}
