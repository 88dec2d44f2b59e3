//! Per-organization ticket throttling.
//!
//! State is process-local and rebuilt empty on restart; losing it only
//! shortens a cooldown, it never corrupts ticket state.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Window between ticket creations by the same user within an organization.
pub const TICKET_CREATION_WINDOW_SECS: i64 = 90;
/// Window between re-selections of the same panel option by the same user.
pub const OPTION_SELECT_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    Ready,
    /// Seconds left before the gate opens again.
    Wait(u64),
}

impl Cooldown {
    pub fn is_ready(&self) -> bool {
        matches!(self, Cooldown::Ready)
    }
}

/// Advisory rate-limit gates evaluated before any side effect. The
/// check-then-record step holds the map's write lock, so two
/// near-simultaneous requests for the same key cannot both pass.
#[derive(Default)]
pub struct CooldownGuard {
    creation: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    options: RwLock<HashMap<(String, String, String), DateTime<Utc>>>,
}

fn gate(last: Option<&DateTime<Utc>>, now: DateTime<Utc>, window_secs: i64) -> Cooldown {
    if let Some(last) = last {
        let elapsed = now.signed_duration_since(*last);
        if elapsed < Duration::seconds(window_secs) {
            let left = window_secs - elapsed.num_seconds();
            return Cooldown::Wait(left.max(1) as u64);
        }
    }
    Cooldown::Ready
}

impl CooldownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate for creating a new ticket. On success the timestamp is recorded
    /// under the same write lock, making check-then-record atomic per key.
    pub async fn check_ticket_creation(&self, org: &str, user: &str, now: DateTime<Utc>) -> Cooldown {
        let mut map = self.creation.write().await;
        let key = (org.to_string(), user.to_string());
        let result = gate(map.get(&key), now, TICKET_CREATION_WINDOW_SECS);
        if result.is_ready() {
            map.insert(key, now);
        }
        result
    }

    /// Read-only view of the creation window, for rejecting a panel select
    /// early without starting or extending anything. Only the submit-time
    /// gate records.
    pub async fn peek_ticket_creation(&self, org: &str, user: &str, now: DateTime<Utc>) -> Cooldown {
        let map = self.creation.read().await;
        gate(
            map.get(&(org.to_string(), user.to_string())),
            now,
            TICKET_CREATION_WINDOW_SECS,
        )
    }

    /// Gate for re-selecting a panel option, independent of the creation
    /// window.
    pub async fn check_option(
        &self,
        org: &str,
        user: &str,
        option_id: &str,
        now: DateTime<Utc>,
    ) -> Cooldown {
        let mut map = self.options.write().await;
        let key = (org.to_string(), user.to_string(), option_id.to_string());
        let result = gate(map.get(&key), now, OPTION_SELECT_WINDOW_SECS);
        if result.is_ready() {
            map.insert(key, now);
        }
        result
    }
}
