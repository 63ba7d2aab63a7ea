//! Small monotonic id types, used in place of a general-purpose uuid crate
//! since these ids never leave the process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_id {
    ($name:ident, $counter:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

counter_id!(ConnectionId, CONNECTION_ID_COUNTER);
counter_id!(SubscriptionId, SUBSCRIPTION_ID_COUNTER);
