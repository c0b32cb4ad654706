//! Versioned search gateway
//!
//! Every node, primary or replica, answers searches through a gateway holding
//! the searchers of its most recently activated versions. Activation swaps the
//! active version under a write lock; a search clones the `Arc` of the searcher
//! it resolved and runs without holding any lock, so a search that started
//! before an activation finishes on the point it started with.
//!
//! A search pinned ahead of the active version follows the configured
//! [`VersionWaitPolicy`]: it either waits on a watch channel (keyed by the
//! active version) up to a timeout, or fails immediately. It is never served
//! from a different version than the one requested.

use crate::config::{SearchConfig, VersionWaitPolicy};
use crate::engine::{Hit, PointSearcher};
use crate::nrt::{NrtPoint, PointListener, Version};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, watch};

/// Search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Target index
    pub index_name: String,
    /// Pinned version; the active version when unset
    pub version: Option<Version>,
    /// Query string; empty or `*` matches all documents
    pub query: String,
    /// Offset of the first returned hit
    pub start_hit: usize,
    /// Maximum number of hits returned
    pub top_hits: usize,
    /// Stored fields to return with each hit
    pub retrieve_fields: Vec<String>,
}

impl SearchRequest {
    /// Match-all request for the first `top_hits` documents
    pub fn new(index_name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            version: None,
            query: query.into(),
            start_hit: 0,
            top_hits: 10,
            retrieve_fields: Vec::new(),
        }
    }

    /// Pin the request to a version
    pub fn at_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Set pagination
    pub fn page(mut self, start_hit: usize, top_hits: usize) -> Self {
        self.start_hit = start_hit;
        self.top_hits = top_hits;
        self
    }

    /// Return these stored fields
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retrieve_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Number of matching documents at `version_served`
    pub total_hits: u64,
    /// Ranked hits
    pub hits: Vec<Hit>,
    /// Version the search ran against
    pub version_served: Version,
}

/// Gateway counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStats {
    /// Searches served
    pub searches: u64,
    /// Searches that waited for a version
    pub waits: u64,
    /// Searches rejected as not yet available
    pub not_available: u64,
    /// Searches rejected because the version was pruned
    pub pruned: u64,
    /// Versions activated
    pub activations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GatewayState {
    active: Version,
    closed: bool,
}

struct Searchers {
    by_version: BTreeMap<Version, Arc<PointSearcher>>,
    active: Version,
    closed: bool,
}

/// Serves searches against exact versions
pub struct SearchGateway {
    index_name: String,
    policy: VersionWaitPolicy,
    retained: usize,
    searchers: RwLock<Searchers>,
    state_tx: watch::Sender<GatewayState>,
    sync_trigger: RwLock<Option<Arc<Notify>>>,
    stats: Mutex<GatewayStats>,
}

impl SearchGateway {
    /// Create a gateway serving `initial_version`
    pub fn new(
        index_name: impl Into<String>,
        config: &SearchConfig,
        initial_version: Version,
        initial_searcher: Arc<PointSearcher>,
    ) -> Self {
        let mut by_version = BTreeMap::new();
        by_version.insert(initial_version, initial_searcher);
        let (state_tx, _) = watch::channel(GatewayState {
            active: initial_version,
            closed: false,
        });

        Self {
            index_name: index_name.into(),
            policy: config.wait_policy,
            retained: config.retained_searchers.max(1),
            searchers: RwLock::new(Searchers {
                by_version,
                active: initial_version,
                closed: false,
            }),
            state_tx,
            sync_trigger: RwLock::new(None),
            stats: Mutex::new(GatewayStats::default()),
        }
    }

    /// Index served by this gateway
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Currently active version
    pub fn active_version(&self) -> Version {
        self.searchers.read().active
    }

    /// Versions with a retained searcher, oldest first
    pub fn retained_versions(&self) -> Vec<Version> {
        self.searchers.read().by_version.keys().copied().collect()
    }

    /// Notified when a search waits for a version the node has not reached
    pub fn set_sync_trigger(&self, trigger: Arc<Notify>) {
        *self.sync_trigger.write() = Some(trigger);
    }

    /// Gateway counters
    pub fn stats(&self) -> GatewayStats {
        self.stats.lock().clone()
    }

    /// Atomically make `version` the active version.
    ///
    /// Returns false (and changes nothing) if `version` is not newer than the
    /// active version or the gateway is closed.
    pub fn activate(&self, version: Version, searcher: Arc<PointSearcher>) -> bool {
        let mut searchers = self.searchers.write();
        if searchers.closed {
            return false;
        }
        if version <= searchers.active {
            tracing::warn!(
                "Ignoring activation of version {} (active version {})",
                version,
                searchers.active
            );
            return false;
        }

        searchers.by_version.insert(version, searcher);
        searchers.active = version;
        while searchers.by_version.len() > self.retained {
            searchers.by_version.pop_first();
        }
        self.state_tx.send_replace(GatewayState {
            active: version,
            closed: false,
        });
        drop(searchers);

        self.stats.lock().activations += 1;
        tracing::debug!("Index {} now serving version {}", self.index_name, version);
        true
    }

    /// Run a search against the requested (or active) version
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        if request.index_name != self.index_name {
            return Err(Error::IndexNotFound(request.index_name));
        }

        let (version, searcher) = self.resolve(request.version).await?;
        let SearchRequest {
            query,
            start_hit,
            top_hits,
            retrieve_fields,
            ..
        } = request;

        let result = tokio::task::spawn_blocking(move || {
            searcher.search(&query, start_hit, top_hits, &retrieve_fields)
        })
        .await
        .map_err(|e| Error::internal(format!("Search task failed: {}", e)))??;

        self.stats.lock().searches += 1;
        Ok(SearchResponse {
            total_hits: result.total_hits,
            hits: result.hits,
            version_served: version,
        })
    }

    async fn resolve(&self, requested: Option<Version>) -> Result<(Version, Arc<PointSearcher>)> {
        let Some(requested) = requested else {
            let searchers = self.searchers.read();
            if searchers.closed {
                return Err(Error::shutdown("Search gateway is closed"));
            }
            return searchers
                .by_version
                .get(&searchers.active)
                .map(|s| (searchers.active, s.clone()))
                .ok_or_else(|| Error::internal("Active searcher missing"));
        };

        let active = match self.lookup(requested)? {
            Ok(searcher) => return Ok((requested, searcher)),
            Err(active) => active,
        };

        let timeout = match self.policy {
            VersionWaitPolicy::Fail => {
                self.stats.lock().not_available += 1;
                return Err(Error::VersionNotAvailable { requested, active });
            }
            VersionWaitPolicy::Wait { timeout } => timeout,
        };

        self.stats.lock().waits += 1;
        tracing::debug!(
            "Search waiting up to {:?} for version {} (active {})",
            timeout,
            requested,
            active
        );
        let trigger = self.sync_trigger.read().clone();
        if let Some(trigger) = trigger {
            trigger.notify_one();
        }

        let mut state_rx = self.state_tx.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| s.closed || s.active >= requested)
                .await
                .map(|s| *s)
        })
        .await;

        match reached {
            Ok(Ok(state)) if !state.closed => match self.lookup(requested)? {
                Ok(searcher) => Ok((requested, searcher)),
                Err(active) => Err(Error::VersionNotAvailable { requested, active }),
            },
            Ok(_) => Err(Error::shutdown("Search gateway closed while waiting")),
            Err(_) => {
                self.stats.lock().not_available += 1;
                Err(Error::VersionNotAvailable {
                    requested,
                    active: self.active_version(),
                })
            }
        }
    }

    /// Searcher for exactly `requested`, or the active version when it is ahead
    fn lookup(&self, requested: Version) -> Result<std::result::Result<Arc<PointSearcher>, Version>> {
        let searchers = self.searchers.read();
        if searchers.closed {
            return Err(Error::shutdown("Search gateway is closed"));
        }
        if let Some(searcher) = searchers.by_version.get(&requested) {
            return Ok(Ok(searcher.clone()));
        }
        if requested <= searchers.active {
            let oldest = searchers
                .by_version
                .keys()
                .next()
                .copied()
                .unwrap_or(searchers.active);
            drop(searchers);
            self.stats.lock().pruned += 1;
            return Err(Error::VersionPruned { requested, oldest });
        }
        Ok(Err(searchers.active))
    }

    /// Release all searchers and wake waiting searches with a shutdown error
    pub fn close(&self) {
        let mut searchers = self.searchers.write();
        if searchers.closed {
            return;
        }
        searchers.closed = true;
        searchers.by_version.clear();
        let active = searchers.active;
        self.state_tx.send_replace(GatewayState {
            active,
            closed: true,
        });
        tracing::debug!("Search gateway for {} closed at version {}", self.index_name, active);
    }
}

impl PointListener for SearchGateway {
    fn point_published(&self, point: &Arc<NrtPoint>, searcher: Arc<PointSearcher>) {
        self.activate(point.version, searcher);
    }
}
