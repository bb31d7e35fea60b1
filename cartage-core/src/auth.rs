//! Bearer tokens authorizing archive transfers
//!
//! Each pending transfer has one random token. The token maps to an
//! [`AuthValue`] naming the requester and the payload root they may fetch.
//! Values are stored as JSON in RocksDB under `/auth/<token>`.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use cid::Cid;
use rand::RngCore;
use rocksdb::{Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const KEY_PREFIX: &str = "/auth/";

/// Number of random bytes in a token
pub const TOKEN_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Identity of an authorized transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthValue {
    /// Requester identity, also the Basic-auth user name
    pub id: String,
    #[serde(with = "cid_string")]
    pub proposal_cid: Cid,
    #[serde(with = "cid_string")]
    pub payload_cid: Cid,
    /// Expected archive size in bytes
    pub size: u64,
    /// Unix seconds
    pub created_at: u64,
}

impl AuthValue {
    pub fn new(id: impl Into<String>, proposal_cid: Cid, payload_cid: Cid, size: u64) -> Self {
        Self {
            id: id.into(),
            proposal_cid,
            payload_cid,
            size,
            created_at: unix_now(),
        }
    }
}

mod cid_string {
    use cid::Cid;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cid: &Cid, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&cid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Cid, D::Error> {
        let s = String::deserialize(d)?;
        Cid::try_from(s.as_str()).map_err(D::Error::custom)
    }
}

/// Persistent token store
#[derive(Clone)]
pub struct AuthTokenDb {
    db: Arc<DB>,
}

impl AuthTokenDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        info!("Opened auth token store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    pub async fn put(&self, token: &str, value: &AuthValue) -> Result<(), AuthError> {
        let key = token_key(token);
        let bytes = serde_json::to_vec(value)?;
        let db = Arc::clone(&self.db);
        run_blocking(move || db.put(key, bytes)).await??;
        debug!("Stored auth token for {} (payload {})", value.id, value.payload_cid);
        Ok(())
    }

    pub async fn get(&self, token: &str) -> Result<Option<AuthValue>, AuthError> {
        let key = token_key(token);
        let db = Arc::clone(&self.db);
        match run_blocking(move || db.get(key)).await?? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a token. Deleting an unknown token is not an error.
    pub async fn delete(&self, token: &str) -> Result<(), AuthError> {
        let key = token_key(token);
        let db = Arc::clone(&self.db);
        run_blocking(move || db.delete(key)).await??;
        Ok(())
    }

    /// Remove every token created before `before` (unix seconds)
    pub async fn delete_expired(&self, before: u64) -> Result<usize, AuthError> {
        let db = Arc::clone(&self.db);
        let removed = run_blocking(move || {
            let mut expired = Vec::new();
            let iter = db.iterator(IteratorMode::From(KEY_PREFIX.as_bytes(), Direction::Forward));
            for item in iter {
                let (key, bytes) = item?;
                if !key.starts_with(KEY_PREFIX.as_bytes()) {
                    break;
                }
                let value: AuthValue = serde_json::from_slice(&bytes)?;
                if value.created_at < before {
                    expired.push(key);
                }
            }
            for key in &expired {
                db.delete(key)?;
            }
            Ok::<_, AuthError>(expired.len())
        })
        .await??;

        if removed > 0 {
            info!("Removed {} expired auth tokens", removed);
        }
        Ok(removed)
    }
}

fn token_key(token: &str) -> Vec<u8> {
    format!("{}{}", KEY_PREFIX, token).into_bytes()
}

async fn run_blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Task(e.to_string()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A fresh random token: 32 bytes, base64url without padding
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `Authorization` header value carrying `id` and `token`
pub fn basic_auth_header(id: &str, token: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", id, token)))
}

/// Split a Basic `Authorization` header value into `(id, token)`
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, token) = decoded.split_once(':')?;
    if token.is_empty() {
        return None;
    }
    Some((id.to_string(), token.to_string()))
}
