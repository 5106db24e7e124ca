//! Authentication module for bearer tokens and cached credentials.
//!
//! This module provides:
//! - `TokenManager`: hands out currently-valid tokens, refreshing through a
//!   single in-flight future shared by all concurrent callers
//! - `CredentialStore`: token and profile cache mirrored into a
//!   session-scoped and a persistent store
//! - `IdentityProvider`: the injected source of short-lived tokens
//! - `ChallengeWidget`: verification widgets some sign-in flows require
//!
//! Tokens are refreshed after 50 minutes by default.

pub mod challenge;
pub mod credentials;
pub mod identity;
pub mod store;
pub mod token;

pub use challenge::{solve_challenge, ChallengeWidget};
pub use credentials::{CredentialRecord, CredentialStore, UserProfile};
pub use identity::{IdentityError, IdentityProvider, RefreshTokenIdentity, StaticIdentity};
pub use store::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageKey, StoreError};
pub use token::{Clock, ManualClock, SystemClock, Token, TokenManager, DEFAULT_REFRESH_INTERVAL_MINUTES};
