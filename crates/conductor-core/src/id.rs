use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of the random base36 suffix in generated ids.
const SUFFIX_LEN: usize = 9;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Caller-chosen identifier of a registered agent.
    AgentId
);
string_id!(
    /// Engine-generated identifier of a task (`task-<millis>-<suffix>`).
    TaskId
);
string_id!(
    /// Engine-generated identifier of a goal (`goal-<millis>-<suffix>`).
    GoalId
);

impl TaskId {
    /// Generate a fresh task id stamped with `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(generate_id("task", now))
    }
}

impl GoalId {
    /// Generate a fresh goal id stamped with `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(generate_id("goal", now))
    }
}

/// Build `<prefix>-<epoch millis>-<9 random base36 chars>`.
///
/// Collisions are possible in principle but require two ids in the same
/// millisecond with equal 46-bit suffixes.
pub fn generate_id(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix}-{}-{}", now.timestamp_millis(), random_suffix())
}

fn random_suffix() -> String {
    let mut bits = Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        let digit = (bits % 36) as u32;
        out.push(char::from_digit(digit, 36).unwrap_or('0'));
        bits /= 36;
    }
    out
}
