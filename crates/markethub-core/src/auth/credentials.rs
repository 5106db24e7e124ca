use std::sync::{Arc, RwLock};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::store::{KeyValueStore, MemoryStore, StorageKey};
use super::token::Token;

/// Minimal profile data cached next to the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl UserProfile {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub token: Token,
    pub profile: Option<UserProfile>,
}

/// Cached credentials mirrored into a session-scoped and a persistent store.
///
/// Reads check the session store first and fall back to the persistent one,
/// copying a hit back into the session store. Writes go to both. `clear`
/// removes every key from both while holding the write lock, so readers see
/// either the full record or nothing.
///
/// Backend failures are logged and otherwise ignored: one broken backend must
/// not fail a request that the other backend can serve.
pub struct CredentialStore {
    session: Arc<dyn KeyValueStore>,
    persistent: Arc<dyn KeyValueStore>,
    lock: RwLock<()>,
}

impl CredentialStore {
    pub fn new(session: Arc<dyn KeyValueStore>, persistent: Arc<dyn KeyValueStore>) -> Self {
        Self {
            session,
            persistent,
            lock: RwLock::new(()),
        }
    }

    /// Both layers in memory. Nothing survives the process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    // ===== Raw access =====

    fn read(&self, key: StorageKey) -> Option<String> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked(key)
    }

    fn read_unlocked(&self, key: StorageKey) -> Option<String> {
        match self.session.get(key) {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => warn!(key = key.as_str(), error = %e, "Session store read failed"),
        }

        match self.persistent.get(key) {
            Ok(Some(value)) => {
                debug!(key = key.as_str(), "Restored credential from persistent store");
                if let Err(e) = self.session.set(key, &value) {
                    warn!(key = key.as_str(), error = %e, "Failed to backfill session store");
                }
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Persistent store read failed");
                None
            }
        }
    }

    fn write(&self, key: StorageKey, value: &str) {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        self.write_unlocked(key, value);
    }

    fn write_unlocked(&self, key: StorageKey, value: &str) {
        if let Err(e) = self.session.set(key, value) {
            warn!(key = key.as_str(), error = %e, "Failed to write session store");
        }
        if let Err(e) = self.persistent.set(key, value) {
            warn!(key = key.as_str(), error = %e, "Failed to write persistent store");
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: StorageKey) -> Option<T> {
        Self::parse_json(key, &self.read(key)?)
    }

    fn parse_json<T: DeserializeOwned>(key: StorageKey, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Ignoring unreadable stored credential");
                None
            }
        }
    }

    fn to_json<T: Serialize>(key: StorageKey, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Failed to serialize credential");
                None
            }
        }
    }

    // ===== Token =====

    pub fn token(&self) -> Option<Token> {
        self.read_json(StorageKey::BearerToken)
    }

    /// The token is stored together with its acquisition time.
    pub fn set_token(&self, token: &Token) {
        if let Some(json) = Self::to_json(StorageKey::BearerToken, token) {
            self.write(StorageKey::BearerToken, &json);
        }
    }

    // ===== Profile =====

    pub fn profile(&self) -> Option<UserProfile> {
        self.read_json(StorageKey::UserProfile)
    }

    pub fn set_profile(&self, profile: &UserProfile) {
        if let Some(json) = Self::to_json(StorageKey::UserProfile, profile) {
            self.write(StorageKey::UserProfile, &json);
        }
    }

    // ===== Push registration =====

    pub fn push_token(&self) -> Option<String> {
        self.read(StorageKey::PushToken)
    }

    pub fn set_push_token(&self, token: &str) {
        self.write(StorageKey::PushToken, token);
    }

    // ===== Record =====

    /// Read token and profile under one lock acquisition.
    pub fn record(&self) -> Option<CredentialRecord> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let token = self.read_unlocked(StorageKey::BearerToken)?;
        let profile = self.read_unlocked(StorageKey::UserProfile);

        Some(CredentialRecord {
            token: Self::parse_json(StorageKey::BearerToken, &token)?,
            profile: profile.and_then(|raw| Self::parse_json(StorageKey::UserProfile, &raw)),
        })
    }

    /// Write token and profile under one lock acquisition.
    pub fn save_record(&self, record: &CredentialRecord) {
        let token = Self::to_json(StorageKey::BearerToken, &record.token);
        let profile = record
            .profile
            .as_ref()
            .and_then(|p| Self::to_json(StorageKey::UserProfile, p));

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        if let Some(json) = token {
            self.write_unlocked(StorageKey::BearerToken, &json);
        }
        if let Some(json) = profile {
            self.write_unlocked(StorageKey::UserProfile, &json);
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.token().is_some()
    }

    /// Remove token, profile and push registration from both stores.
    pub fn clear(&self) {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        for key in StorageKey::ALL {
            if let Err(e) = self.session.remove(key) {
                warn!(key = key.as_str(), error = %e, "Failed to clear session store");
            }
            if let Err(e) = self.persistent.remove(key) {
                warn!(key = key.as_str(), error = %e, "Failed to clear persistent store");
            }
        }
        info!("Cleared stored credentials");
    }
}
