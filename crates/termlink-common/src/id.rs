use std::sync::atomic::{AtomicU64, Ordering};

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonically increasing token.
///
/// Timers capture one of these when armed; a firing timer whose token no
/// longer matches the owner's current token is stale and must do nothing.
pub fn next_token() -> u64 {
    TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
}
