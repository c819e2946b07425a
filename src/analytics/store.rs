use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AnalyticsRecorder, AnalyticsState};

pub const ANALYTICS_FILE_NAME: &str = "analytics.json";
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Characters the remote document store refuses inside keys.
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '#', '$', '/', '[', ']'];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote store returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("token signing failed: {0}")]
    Auth(#[from] jsonwebtoken::errors::Error),
    #[error("invalid credentials file {}: {reason}", path.display())]
    Credentials { path: PathBuf, reason: String },
}

/// One place analytics snapshots can be written to and read back from.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the store holds no snapshot yet.
    async fn load(&self) -> Result<Option<AnalyticsState>, StoreError>;

    async fn save(&self, state: &AnalyticsState) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file on local disk.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    path: PathBuf,
}

impl LocalFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(ANALYTICS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for LocalFileStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn load(&self) -> Result<Option<AnalyticsState>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn save(&self, state: &AnalyticsState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let pretty = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&self.path, pretty)
            .await
            .map_err(|err| self.io_error(err))
    }
}

/// Remote first, local always. Availability of the remote is fixed at
/// construction time.
pub struct DualStore {
    remote: Option<Box<dyn SnapshotStore>>,
    local: LocalFileStore,
}

impl DualStore {
    pub fn new(remote: Option<Box<dyn SnapshotStore>>, local: LocalFileStore) -> Self {
        Self { remote, local }
    }

    pub fn local_only(local: LocalFileStore) -> Self {
        Self::new(None, local)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Never fails: every broken source degrades to the next one, and
    /// finally to a fresh state.
    pub async fn load(&self) -> AnalyticsState {
        if let Some(remote) = self.remote.as_ref() {
            match remote.load().await {
                Ok(Some(state)) => {
                    info!(
                        store = remote.name(),
                        total_requests = state.total_requests,
                        "analytics restored"
                    );
                    return state;
                }
                Ok(None) => debug!(store = remote.name(), "no remote analytics snapshot"),
                Err(err) => warn!(store = remote.name(), error = %err, "remote analytics load failed"),
            }
        }

        match self.local.load().await {
            Ok(Some(state)) => {
                info!(
                    store = self.local.name(),
                    path = %self.local.path().display(),
                    total_requests = state.total_requests,
                    "analytics restored"
                );
                state
            }
            Ok(None) => {
                info!("no analytics snapshot found; starting fresh");
                AnalyticsState::default()
            }
            Err(err) => {
                warn!(
                    path = %self.local.path().display(),
                    error = %err,
                    "local analytics load failed; starting fresh"
                );
                AnalyticsState::default()
            }
        }
    }

    /// The local write is attempted even when the remote write failed.
    pub async fn save(&self, state: &AnalyticsState) {
        if let Some(remote) = self.remote.as_ref() {
            if let Err(err) = remote.save(state).await {
                warn!(store = remote.name(), error = %err, "remote analytics save failed");
            }
        }

        match self.local.save(state).await {
            Ok(()) => debug!(path = %self.local.path().display(), "analytics saved"),
            Err(err) => warn!(
                path = %self.local.path().display(),
                error = %err,
                "local analytics save failed"
            ),
        }
    }
}

/// Saves a snapshot every `period` until `shutdown` fires. The caller does
/// the final save after awaiting the handle.
pub fn spawn_autosave(
    recorder: Arc<AnalyticsRecorder>,
    store: Arc<DualStore>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => store.save(&recorder.snapshot()).await,
            }
        }
        debug!("analytics autosave stopped");
    })
}

/// Stops the autosave loop, waits for any save in flight, then writes the
/// final snapshot.
pub async fn finish_autosave(
    autosave: JoinHandle<()>,
    shutdown: &CancellationToken,
    recorder: &AnalyticsRecorder,
    store: &DualStore,
) {
    shutdown.cancel();
    if let Err(err) = autosave.await {
        warn!(error = %err, "analytics autosave task failed");
    }
    store.save(&recorder.snapshot()).await;
    info!("analytics saved");
}

pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if FORBIDDEN_KEY_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Rewrites every object key, at any depth, into the remote store's key syntax.
pub fn sanitize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (sanitize_key(&key), sanitize_keys(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_keys).collect()),
        other => other,
    }
}
