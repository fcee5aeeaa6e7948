//! Fixed-window abuse guard over the state store.
//!
//! Counters are keyed `rate:{operation}:{identity}` so one identity being
//! throttled for logins never affects its token redemptions. The check
//! increments first and decides after, which keeps the decision atomic under
//! concurrency. Store failures propagate as errors: an unreachable store
//! must never read as "not limited".

use crate::config::RateLimitConfig;
use crate::store::{StateStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// The guarded operations, each with its own counter namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedOp {
    LoginByAccount,
    LoginByIp,
    AuthorizeByIp,
    TokenByClient,
}

impl GuardedOp {
    fn key_segment(self) -> &'static str {
        match self {
            Self::LoginByAccount => "login_account",
            Self::LoginByIp => "login_ip",
            Self::AuthorizeByIp => "authorize_ip",
            Self::TokenByClient => "token_client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Ceiling exceeded; `count` is how many attempts the window has seen.
    Limited { count: u64 },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    window: Duration,
    login_per_account: u64,
    login_per_ip: u64,
    authorize_per_ip: u64,
    token_per_client: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            window: Duration::from_secs(config.window_secs),
            login_per_account: config.login_per_account,
            login_per_ip: config.login_per_ip,
            authorize_per_ip: config.authorize_per_ip,
            token_per_client: config.token_per_client,
        }
    }

    fn ceiling_for(&self, op: GuardedOp) -> u64 {
        match op {
            GuardedOp::LoginByAccount => self.login_per_account,
            GuardedOp::LoginByIp => self.login_per_ip,
            GuardedOp::AuthorizeByIp => self.authorize_per_ip,
            GuardedOp::TokenByClient => self.token_per_client,
        }
    }

    /// Count an attempt of `op` by `identity` and decide whether it may
    /// proceed. The attempt is counted even when the answer is `Limited`.
    pub fn check(&self, op: GuardedOp, identity: &str) -> Result<Decision, StoreError> {
        let key = counter_key(op, identity);
        let window = self
            .store
            .increment_with_window(&key, self.window, self.ceiling_for(op))?;
        if window.allowed {
            Ok(Decision::Allowed)
        } else {
            tracing::warn!(
                operation = op.key_segment(),
                identity = %identity,
                count = window.count,
                "rate ceiling exceeded"
            );
            Ok(Decision::Limited {
                count: window.count,
            })
        }
    }

    /// Clear the counter for `op`/`identity`, e.g. failed-login attempts
    /// after a successful login.
    pub fn reset(&self, op: GuardedOp, identity: &str) -> Result<(), StoreError> {
        self.store.reset_window(&counter_key(op, identity))
    }
}

fn counter_key(op: GuardedOp, identity: &str) -> String {
    format!("rate:{}:{}", op.key_segment(), identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(login_per_account: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig {
                window_secs: 60,
                login_per_account,
                login_per_ip: 20,
                authorize_per_ip: 30,
                token_per_client: 60,
            },
        )
    }

    #[test]
    fn allows_up_to_the_ceiling_then_limits() {
        let guard = limiter(3);
        for _ in 0..3 {
            assert_eq!(
                guard.check(GuardedOp::LoginByAccount, "alice").unwrap(),
                Decision::Allowed
            );
        }
        assert!(matches!(
            guard.check(GuardedOp::LoginByAccount, "alice").unwrap(),
            Decision::Limited { count: 4 }
        ));
    }

    #[test]
    fn identities_do_not_share_counters() {
        let guard = limiter(1);
        guard.check(GuardedOp::LoginByAccount, "alice").unwrap();
        assert_eq!(
            guard.check(GuardedOp::LoginByAccount, "bob").unwrap(),
            Decision::Allowed
        );
    }

    #[test]
    fn operations_do_not_share_counters() {
        let guard = limiter(1);
        guard.check(GuardedOp::LoginByAccount, "alice").unwrap();
        guard.check(GuardedOp::LoginByAccount, "alice").unwrap();
        assert_eq!(
            guard.check(GuardedOp::TokenByClient, "alice").unwrap(),
            Decision::Allowed
        );
    }

    #[test]
    fn store_failure_is_an_error_not_an_allow() {
        let guard = RateLimiter::new(
            Arc::new(crate::store::FailingStore),
            &RateLimitConfig::default(),
        );
        assert!(guard.check(GuardedOp::LoginByAccount, "alice").is_err());
    }

    #[test]
    fn reset_clears_the_counter() {
        let guard = limiter(1);
        guard.check(GuardedOp::LoginByAccount, "alice").unwrap();
        guard.check(GuardedOp::LoginByAccount, "alice").unwrap();
        guard.reset(GuardedOp::LoginByAccount, "alice").unwrap();
        assert_eq!(
            guard.check(GuardedOp::LoginByAccount, "alice").unwrap(),
            Decision::Allowed
        );
    }
}
