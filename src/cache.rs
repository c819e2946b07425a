//! Protocol servers keyed by the credentials they were built for.

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use rmcp::transport::{
    StreamableHttpServerConfig, StreamableHttpService,
    streamable_http_server::session::never::NeverSessionManager,
};
use tracing::{debug, info, warn};

use crate::{
    PlausibleClient, PlausibleError, analytics::AnalyticsRecorder, preview_key,
    tools::PlausibleServer,
};

pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(capacity) => capacity,
    None => unreachable!(),
};
const KEY_PREFIX_CHARS: usize = 8;

pub type McpHttpService = StreamableHttpService<PlausibleServer, NeverSessionManager>;
pub type ServerHandle = Arc<CachedServer>;

/// A protocol server and the stateless HTTP service that drives it.
pub struct CachedServer {
    server: PlausibleServer,
    service: McpHttpService,
}

impl CachedServer {
    pub fn build(
        api_url: &str,
        api_key: &str,
        recorder: Option<Arc<AnalyticsRecorder>>,
    ) -> Result<Self, PlausibleError> {
        let client = PlausibleClient::new(api_url, api_key)?;
        let server = PlausibleServer::new(client, recorder);
        let factory = server.clone();
        let service = StreamableHttpService::new(
            move || Ok(factory.clone()),
            Arc::new(NeverSessionManager::default()),
            StreamableHttpServerConfig {
                sse_keep_alive: None,
                stateful_mode: false,
                ..Default::default()
            },
        );
        Ok(Self { server, service })
    }

    pub fn server(&self) -> &PlausibleServer {
        &self.server
    }

    /// A fresh handle onto the service, ready for a single `oneshot`.
    pub fn http_service(&self) -> McpHttpService {
        self.service.clone()
    }
}

/// `"<normalized base URL>|<first 8 characters of the key>"`. Two keys
/// sharing a prefix against the same instance share a server.
pub fn credential_key(api_url: &str, api_key: &str) -> String {
    let base = api_url.trim().trim_end_matches('/');
    let prefix: String = api_key.trim().chars().take(KEY_PREFIX_CHARS).collect();
    format!("{base}|{prefix}")
}

pub struct ServerCache {
    entries: Mutex<LruCache<String, ServerHandle>>,
    recorder: Arc<AnalyticsRecorder>,
}

impl ServerCache {
    pub fn new(capacity: NonZeroUsize, recorder: Arc<AnalyticsRecorder>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            recorder,
        }
    }

    /// Returns the server for these credentials, building it on first use.
    /// An entry whose key the upstream has rejected is dropped and rebuilt
    /// from the credentials presented now, so a rotated key takes effect on
    /// the next request.
    pub fn resolve(&self, api_url: &str, api_key: &str) -> Result<ServerHandle, PlausibleError> {
        let handle = self.get_or_build(api_url, api_key)?;
        if !handle.server().client().credentials_rejected() {
            return Ok(handle);
        }

        warn!(
            api_url = %api_url.trim(),
            key = %preview_key(api_key.trim()),
            "upstream rejected cached credentials; rebuilding server"
        );
        self.invalidate(api_url, api_key);
        self.get_or_build(api_url, api_key)
    }

    /// The lock is held while building so concurrent first calls share one
    /// instance.
    fn get_or_build(&self, api_url: &str, api_key: &str) -> Result<ServerHandle, PlausibleError> {
        let key = credential_key(api_url, api_key);
        let mut entries = self.entries.lock();
        if let Some(handle) = entries.get(&key) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(CachedServer::build(
            api_url,
            api_key,
            Some(self.recorder.clone()),
        )?);
        if let Some((evicted, _)) = entries.push(key, handle.clone()) {
            debug!(evicted = %evicted_label(&evicted), "server cache evicted entry");
        }
        info!(
            api_url = %api_url.trim(),
            key = %preview_key(api_key.trim()),
            cached = entries.len(),
            "built protocol server"
        );
        Ok(handle)
    }

    /// Drops the entry for rotated or revoked credentials.
    pub fn invalidate(&self, api_url: &str, api_key: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .pop(&credential_key(api_url, api_key))
            .is_some();
        if removed {
            info!(key = %preview_key(api_key.trim()), "server cache entry invalidated");
        }
        removed
    }

    /// Server for credential-less discovery calls. Never cached.
    pub fn demo(&self, api_url: &str) -> Result<CachedServer, PlausibleError> {
        CachedServer::build(api_url, "", Some(self.recorder.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

/// Cache keys embed a key prefix; only the URL part is logged.
fn evicted_label(key: &str) -> &str {
    key.split('|').next().unwrap_or(key)
}
