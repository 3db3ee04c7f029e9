//! Per-identity edit budgets ("ink") with lazy, timer-free refill.
//!
//! Accounts are keyed by a stable editor identity (guest id or user id),
//! created full on first touch, and live only for the process lifetime.
//! Refill is a pure function of elapsed time computed on access; there is no
//! background timer per identity. Every entry point takes `now` explicitly
//! so tests can drive the clock.

use shared::{GUEST_MAX_INK, GUEST_REFILL_MS, USER_MAX_INK, USER_REFILL_MS};
use std::collections::HashMap;
use std::time::Instant;

/// Snapshot of one identity's budget, reported back to that client only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InkStatus {
    /// Whole units currently available (floored for display).
    pub ink: u64,
    pub max: u64,
    /// Milliseconds to regain one unit.
    pub rate_ms: u64,
}

#[derive(Debug)]
struct InkAccount {
    ink: f64,
    last_refill: Instant,
    authenticated: bool,
}

impl InkAccount {
    fn new(now: Instant) -> Self {
        Self {
            ink: GUEST_MAX_INK,
            last_refill: now,
            authenticated: false,
        }
    }

    fn max(&self) -> f64 {
        if self.authenticated {
            USER_MAX_INK
        } else {
            GUEST_MAX_INK
        }
    }

    fn rate_ms(&self) -> u64 {
        if self.authenticated {
            USER_REFILL_MS
        } else {
            GUEST_REFILL_MS
        }
    }

    /// `ink = min(max, ink + elapsed / rate)`, then reset the refill mark.
    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms > 0.0 {
            self.ink = (self.ink + elapsed_ms / self.rate_ms() as f64).min(self.max());
            self.last_refill = now;
        }
    }
}

/// All ink accounts for this process.
#[derive(Debug, Default)]
pub struct InkLedger {
    accounts: HashMap<String, InkAccount>,
}

impl InkLedger {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
        }
    }

    fn account(&mut self, identity: &str, now: Instant) -> &mut InkAccount {
        self.accounts
            .entry(identity.to_string())
            .or_insert_with(|| InkAccount::new(now))
    }

    /// Refills and returns the identity's current balance.
    pub fn available(&mut self, identity: &str, now: Instant) -> f64 {
        let account = self.account(identity, now);
        account.refill(now);
        account.ink
    }

    /// Deducts `amount` units; callers check affordability first via
    /// [`InkLedger::available`].
    pub fn debit(&mut self, identity: &str, amount: f64, now: Instant) {
        let account = self.account(identity, now);
        account.refill(now);
        account.ink = (account.ink - amount).max(0.0);
    }

    pub fn status(&mut self, identity: &str, now: Instant) -> InkStatus {
        let account = self.account(identity, now);
        account.refill(now);
        InkStatus {
            ink: account.ink.floor() as u64,
            max: account.max() as u64,
            rate_ms: account.rate_ms(),
        }
    }

    /// Upgrades an identity to authenticated limits and tops its balance up
    /// to the new capacity. Verifying the authentication is the outer
    /// layer's job.
    pub fn set_authenticated(&mut self, identity: &str, now: Instant) {
        let account = self.account(identity, now);
        account.refill(now);
        if !account.authenticated {
            account.authenticated = true;
            account.ink = account.ink.max(USER_MAX_INK);
        }
    }
}
