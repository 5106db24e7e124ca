//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::{IdentityError, IdentityProvider};

/// Issues `token-1`, `token-2`, ... and counts how it was called.
#[derive(Default)]
pub struct FakeIdentity {
    calls: AtomicUsize,
    forced_calls: AtomicUsize,
    signed_out: AtomicBool,
    unreachable: AtomicBool,
    delay: Option<Duration>,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out(&self) {
        self.signed_out.store(true, Ordering::SeqCst);
    }

    pub fn fail_network(&self, fail: bool) {
        self.unreachable.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn acquire_token(&self, force_refresh: bool) -> Result<String, IdentityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if force_refresh {
            self.forced_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.signed_out.load(Ordering::SeqCst) {
            return Err(IdentityError::NoSession);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IdentityError::Unreachable("connection refused".to_string()));
        }
        Ok(format!("token-{}", n))
    }
}
