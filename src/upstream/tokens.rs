//! Token persistence for upstream API authentication.
//!
//! Read-through cache over a JSON file. The cached record is served while
//! `now < expires_at`; expiry checks elsewhere apply a 5 minute skew so a
//! token is refreshed before it actually lapses.

use std::path::PathBuf;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Tokens are treated as expired this many seconds before nominal expiry.
pub const TOKEN_EXPIRY_SKEW_SECONDS: f64 = 300.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token_expires_at: f64,
}

impl StoredTokens {
    pub fn is_expired(&self) -> bool {
        now_unix() >= self.access_token_expires_at - TOKEN_EXPIRY_SKEW_SECONDS
    }
}

pub fn now_unix() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct TokenStore {
    path: PathBuf,
    cache: RwLock<Option<StoredTokens>>,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Returns the current token record, preferring the in-memory copy while
    /// it has not passed its nominal expiry.
    pub fn load(&self) -> Option<StoredTokens> {
        {
            let cache = self.cache.read();
            if let Some(tokens) = cache.as_ref() {
                if now_unix() < tokens.access_token_expires_at {
                    debug!("Using cached tokens");
                    return Some(tokens.clone());
                }
            }
        }

        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredTokens>(&raw) {
            Ok(tokens) => {
                *self.cache.write() = Some(tokens.clone());
                debug!("Loaded tokens from file");
                Some(tokens)
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to parse token file");
                None
            }
        }
    }

    pub fn save(&self, tokens: &StoredTokens) -> bool {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(error = %e, "Failed to create token directory");
                return false;
            }
        }

        let json = match serde_json::to_string_pretty(tokens) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize tokens");
                return false;
            }
        };

        match std::fs::write(&self.path, json) {
            Ok(()) => {
                *self.cache.write() = Some(tokens.clone());
                info!("Tokens saved and cached");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to save tokens");
                false
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_applies_five_minute_skew() {
        let fresh = StoredTokens {
            access_token: "a".into(),
            refresh_token: None,
            access_token_expires_at: now_unix() + 600.0,
        };
        assert!(!fresh.is_expired());

        // Inside the skew window: nominally valid but treated as expired.
        let near = StoredTokens {
            access_token: "a".into(),
            refresh_token: None,
            access_token_expires_at: now_unix() + 200.0,
        };
        assert!(near.is_expired());

        let past = StoredTokens {
            access_token: "a".into(),
            refresh_token: None,
            access_token_expires_at: now_unix() - 10.0,
        };
        assert!(past.is_expired());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().is_none());

        let tokens = StoredTokens {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            access_token_expires_at: now_unix() + 7200.0,
        };
        assert!(store.save(&tokens));

        let loaded = store.load().unwrap();
        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
    }

    #[test]
    fn stale_cache_falls_back_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        let expired = StoredTokens {
            access_token: "old".into(),
            refresh_token: None,
            access_token_expires_at: now_unix() - 1.0,
        };
        store.save(&expired);

        // Another process may have rewritten the file; an expired cache must
        // re-read it.
        let replacement = StoredTokens {
            access_token: "new".into(),
            refresh_token: None,
            access_token_expires_at: now_unix() + 7200.0,
        };
        std::fs::write(
            dir.path().join("tokens.json"),
            serde_json::to_string(&replacement).unwrap(),
        )
        .unwrap();

        assert_eq!(store.load().unwrap().access_token, "new");
    }
}
