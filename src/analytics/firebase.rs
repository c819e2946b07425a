//! Firebase Realtime Database backend for analytics snapshots.
//!
//! Authenticates with a Google service account: a signed RS256 assertion is
//! exchanged for an OAuth access token, which is reused until shortly before
//! it expires.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::AnalyticsState;
use super::store::{SnapshotStore, StoreError, sanitize_keys};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/firebase.database https://www.googleapis.com/auth/userinfo.email";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const COLLECTION: &str = "analytics";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_owned()
}

impl ServiceAccount {
    pub fn database_url(&self) -> String {
        match self.database_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_owned(),
            _ => format!("https://{}-default-rtdb.firebaseio.com", self.project_id),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FirebaseStore {
    client: Client,
    account: ServiceAccount,
    database_url: String,
    server_id: String,
    token: Mutex<Option<AccessToken>>,
}

impl FirebaseStore {
    pub fn new(account: ServiceAccount, server_id: &str) -> Self {
        Self {
            client: Client::new(),
            database_url: account.database_url(),
            account,
            server_id: server_id.to_owned(),
            token: Mutex::new(None),
        }
    }

    pub fn from_file(path: &Path, server_id: &str) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let account: ServiceAccount =
            serde_json::from_str(&raw).map_err(|err| StoreError::Credentials {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        if !account.private_key.contains("PRIVATE KEY") {
            return Err(StoreError::Credentials {
                path: path.to_path_buf(),
                reason: "private_key is not a PEM encoded key".to_owned(),
            });
        }
        Ok(Self::new(account, server_id))
    }

    /// Uses the first credentials file that exists on the search path.
    /// Returns `None` when remote persistence is unavailable for this run.
    pub fn discover(search_path: &[PathBuf], server_id: &str) -> Option<Self> {
        let Some(path) = search_path.iter().find(|path| path.is_file()) else {
            info!("no firebase credentials found; analytics persist locally only");
            return None;
        };

        match Self::from_file(path, server_id) {
            Ok(store) => {
                info!(
                    path = %path.display(),
                    database = %store.database_url,
                    "firebase analytics store enabled"
                );
                Some(store)
            }
            Err(err) => {
                warn!(error = %err, "firebase analytics store disabled");
                None
            }
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn document_url(&self) -> String {
        format!(
            "{}/{}/{}.json",
            self.database_url,
            COLLECTION,
            urlencoding::encode(&self.server_id)
        )
    }

    async fn access_token(&self) -> Result<String, StoreError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref()
            && token.expires_at - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now
        {
            return Ok(token.value.clone());
        }

        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: TOKEN_SCOPE,
            aud: &self.account.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response.json().await?;

        let fresh = AccessToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        };
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

/// The document written remotely: the snapshot with store-safe keys plus a
/// write timestamp.
pub fn remote_document(state: &AnalyticsState, now: DateTime<Utc>) -> Result<Value, StoreError> {
    let mut document = serde_json::to_value(state)?;
    if let Value::Object(map) = &mut document {
        map.insert("lastUpdated".to_owned(), Value::String(now.to_rfc3339()));
    }
    Ok(sanitize_keys(document))
}

#[async_trait]
impl SnapshotStore for FirebaseStore {
    fn name(&self) -> &'static str {
        "firebase"
    }

    async fn load(&self) -> Result<Option<AnalyticsState>, StoreError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.document_url())
            .query(&[("access_token", token.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let document: Value = response.json().await?;
        match document {
            Value::Null => Ok(None),
            Value::Object(ref map) if map.is_empty() => Ok(None),
            other => Ok(Some(serde_json::from_value(other)?)),
        }
    }

    async fn save(&self, state: &AnalyticsState) -> Result<(), StoreError> {
        let document = remote_document(state, Utc::now())?;
        let token = self.access_token().await?;
        let response = self
            .client
            .put(self.document_url())
            .query(&[("access_token", token.as_str())])
            .json(&document)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
