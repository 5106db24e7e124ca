//! Bearer token acquisition, caching and single-flight refresh.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::challenge::{solve_challenge, ChallengeWidget};
use super::credentials::{CredentialRecord, CredentialStore, UserProfile};
use super::identity::IdentityProvider;
use crate::api::ApiError;

/// Soft refresh interval in minutes.
/// Tokens live for about 60 minutes; refreshing at 50 leaves headroom for
/// clock skew and slow requests.
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: i64 = 50;

/// An opaque bearer string and the time it was acquired.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    value: String,
    acquired_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            acquired_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// TokenManager
// ============================================================================

type RefreshFuture = Shared<BoxFuture<'static, Result<Token, ApiError>>>;

#[derive(Default)]
struct TokenState {
    current: Option<Token>,
    last_refresh: Option<DateTime<Utc>>,
    in_flight: Option<RefreshFuture>,
    /// Bumped on sign-out so a refresh started before it cannot write back.
    generation: u64,
}

impl TokenState {
    fn reset(&mut self) {
        self.current = None;
        self.last_refresh = None;
        self.in_flight = None;
        self.generation += 1;
    }
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    credentials: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    state: Mutex<TokenState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a shared refresh and record it as in flight. `profile`, when
    /// given, is written together with the new token.
    fn start_refresh(
        self: &Arc<Self>,
        state: &mut TokenState,
        force_network: bool,
        profile: Option<UserProfile>,
    ) -> RefreshFuture {
        let pending = Arc::clone(self)
            .refresh(force_network, state.generation, profile)
            .boxed()
            .shared();
        state.in_flight = Some(pending.clone());
        pending
    }

    async fn refresh(
        self: Arc<Self>,
        force_network: bool,
        generation: u64,
        profile: Option<UserProfile>,
    ) -> Result<Token, ApiError> {
        info!(force_network, "Refreshing bearer token");
        let result = self.identity.acquire_token(force_network).await;

        let mut state = self.lock_state();
        if state.generation != generation {
            debug!("Discarding token refresh that raced with sign-out");
            return Err(ApiError::TokenAcquisitionFailed(
                "signed out while refreshing".to_string(),
            ));
        }
        state.in_flight = None;

        match result {
            Ok(value) => {
                let token = Token::new(value, self.clock.now());
                state.current = Some(token.clone());
                state.last_refresh = Some(token.acquired_at());
                match profile {
                    Some(profile) => self.credentials.save_record(&CredentialRecord {
                        token: token.clone(),
                        profile: Some(profile),
                    }),
                    None => self.credentials.set_token(&token),
                }
                debug!(acquired_at = %token.acquired_at(), "Bearer token refreshed");
                Ok(token)
            }
            Err(e) => {
                let err = ApiError::from(e);
                if err.requires_sign_in() {
                    warn!(error = %err, "No authenticated identity, clearing credentials");
                    state.reset();
                    self.credentials.clear();
                } else {
                    warn!(error = %err, "Token refresh failed");
                }
                Err(err)
            }
        }
    }
}

/// Hands out currently-valid bearer tokens.
///
/// Clone is cheap and every clone shares the same cache and in-flight
/// refresh, so construct one per signed-in application and pass it around.
/// Concurrent callers that need a refresh all await one shared future; only
/// one call reaches the identity provider.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(identity: Arc<dyn IdentityProvider>, credentials: Arc<CredentialStore>) -> Self {
        Self::with_clock(
            identity,
            credentials,
            Duration::minutes(DEFAULT_REFRESH_INTERVAL_MINUTES),
            Arc::new(SystemClock),
        )
    }

    /// Picks up a token left in `credentials` by an earlier session; it counts
    /// as refreshed at its stored acquisition time.
    pub fn with_clock(
        identity: Arc<dyn IdentityProvider>,
        credentials: Arc<CredentialStore>,
        refresh_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut state = TokenState::default();
        if let Some(token) = credentials.token() {
            debug!(acquired_at = %token.acquired_at(), "Restored cached token");
            state.last_refresh = Some(token.acquired_at());
            state.current = Some(token);
        }

        Self {
            inner: Arc::new(Inner {
                identity,
                credentials,
                clock,
                refresh_interval,
                state: Mutex::new(state),
            }),
        }
    }

    /// Return a currently-valid token.
    ///
    /// Without `force_refresh` a token younger than the refresh interval is
    /// returned from cache. A refresh already in flight is joined whatever
    /// `force_refresh` says.
    pub async fn get_token(&self, force_refresh: bool) -> Result<Token, ApiError> {
        let pending = {
            let mut state = self.inner.lock_state();

            if let Some(pending) = state.in_flight.clone() {
                debug!(force_refresh, "Joining in-flight token refresh");
                pending
            } else {
                let now = self.inner.clock.now();
                let stale = match state.last_refresh {
                    Some(last) => now - last >= self.inner.refresh_interval,
                    None => true,
                };

                if !force_refresh && !stale {
                    if let Some(ref token) = state.current {
                        return Ok(token.clone());
                    }
                }

                // A token that aged out must come from the network, not from
                // the provider's own cache.
                let force_network = force_refresh || (stale && state.current.is_some());
                self.inner.start_refresh(&mut state, force_network, None)
            }
        };

        pending.await
    }

    /// Replace a token the server rejected.
    ///
    /// Forces a refresh only while `rejected` is still the cached token. If
    /// another caller already replaced it, the replacement is returned
    /// without calling the identity provider again.
    pub async fn refresh_rejected(&self, rejected: &Token) -> Result<Token, ApiError> {
        let pending = {
            let mut state = self.inner.lock_state();

            if let Some(pending) = state.in_flight.clone() {
                debug!("Joining in-flight token refresh");
                pending
            } else {
                let replaced = state
                    .current
                    .as_ref()
                    .filter(|current| current.value() != rejected.value())
                    .cloned();
                if let Some(current) = replaced {
                    debug!("Rejected token was already replaced");
                    return Ok(current);
                }
                self.inner.start_refresh(&mut state, true, None)
            }
        };

        pending.await
    }

    /// Acquire a fresh token for a newly signed-in user. The token and
    /// profile are stored together.
    pub async fn sign_in(&self, profile: UserProfile) -> Result<Token, ApiError> {
        let (pending, joined) = {
            let mut state = self.inner.lock_state();
            match state.in_flight.clone() {
                Some(pending) => (pending, true),
                None => (
                    self.inner.start_refresh(&mut state, true, Some(profile.clone())),
                    false,
                ),
            }
        };

        let token = pending.await?;
        if joined {
            self.inner.credentials.save_record(&CredentialRecord {
                token: token.clone(),
                profile: Some(profile.clone()),
            });
        }
        info!(uid = %profile.uid, "Signed in");
        Ok(token)
    }

    /// Sign in through a verification challenge. The widget is disposed
    /// before this returns.
    pub async fn sign_in_with_challenge<W>(
        &self,
        profile: UserProfile,
        widget: &mut W,
    ) -> Result<Token, ApiError>
    where
        W: ChallengeWidget + ?Sized,
    {
        let proof = solve_challenge(widget).await?;
        self.inner.identity.submit_challenge(&proof).await?;
        self.sign_in(profile).await
    }

    /// Drop the cached token and clear both credential stores.
    pub fn sign_out(&self) {
        let mut state = self.inner.lock_state();
        state.reset();
        self.inner.credentials.clear();
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.lock_state().current.is_some()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.lock_state().last_refresh
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.inner.credentials.profile()
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.credentials
    }
}
