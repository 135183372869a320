use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Random 63-bit value, never negative when carried in a signed long property.
#[must_use]
pub fn random63_bit_value() -> u64 {
    rand::random::<u64>() >> 1
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

macro_rules! random_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            pub value: u64,
            /// Creation time in milliseconds since the Unix epoch.
            pub timestamp: u64,
        }

        impl $name {
            #[must_use]
            pub fn new_instance() -> Self {
                Self::new(random63_bit_value(), now_millis())
            }

            #[must_use]
            pub fn new(value: u64, timestamp: u64) -> Self {
                Self { value, timestamp }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:016x}", self.value)
            }
        }
    };
}

random_id!(
    /// Names one outstanding request/reply pair. Echoed back by the server.
    InvocationId
);

random_id!(
    /// Names one client connection. Attached to every request.
    SessionId
);

/// Trace context forwarded on behalf of an external caller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace {
    pub invocation_id: InvocationId,
    pub session_id: SessionId,
}

/// Identity a privileged client acts on behalf of.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub store_id: String,
    pub owning_legal_identity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_positive() {
        let ids: HashSet<_> = (0..10_000).map(|_| InvocationId::new_instance()).collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| i64::try_from(id.value).is_ok()));
        assert!(ids.iter().all(|id| id.timestamp > 0));
    }

    #[test]
    fn test_display() {
        let id = SessionId::new(0xbeef, 7);
        assert_eq!(id.to_string(), "000000000000beef");
    }
}
