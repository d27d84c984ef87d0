//! Time window cache of raw service graph data.
//!
//! Requests for the same window share one backend population. Relative windows (`now-15m -> now`) are refreshed in
//! the background while they keep being requested, and recent absolute windows are refreshed until their data
//! settles.

pub mod entry;
pub mod jitter;
pub mod key;

use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::defaults::{PREFETCH_DEADLINE_SECS, PREFETCH_WINDOW_SECS};
use crate::config::CacheConfig;
use crate::errors::{Result, ServiceGraphError};
use crate::flows::{Fetched, LabelMap};
use crate::graph::{ServiceGraphRequest, TimeRange};
use crate::servicegraph::backend::ServiceGraphBackend;
use crate::servicegraph::ServiceGraphData;

pub use entry::{CacheData, CacheEntry, PopulatedData};
pub use jitter::JitterTicker;
pub use key::CacheKey;

/// Entries ordered by access, least recently used first.
#[derive(Default)]
struct CacheState {
    entries: IndexMap<CacheKey, CacheEntry>,
}

impl CacheState {
    /// Moves the entry to the most recently used end.
    fn touch(&mut self, key: &CacheKey, now: Instant) {
        if let Some((k, mut entry)) = self.entries.shift_remove_entry(key) {
            entry.accessed = now;
            self.entries.insert(k, entry);
        }
    }
}

struct CacheInner {
    backend: Arc<dyn ServiceGraphBackend>,
    config: CacheConfig,
    token: CancellationToken,
    state: Mutex<CacheState>,
    next_id: AtomicU64,
}

/// Shared cache of populated time windows.
///
/// Dropping the cache stops the background loop and cancels any population still running.
pub struct ServiceGraphCache {
    inner: Arc<CacheInner>,
    _stop: DropGuard,
}

impl ServiceGraphCache {
    /// Creates the cache and starts its background update loop. Cancelling `token` stops the loop and every
    /// population.
    pub fn new(backend: Arc<dyn ServiceGraphBackend>, config: CacheConfig, token: CancellationToken) -> Self {
        let token = token.child_token();
        let inner = Arc::new(CacheInner {
            backend,
            config,
            token: token.clone(),
            state: Mutex::new(CacheState::default()),
            next_id: AtomicU64::new(0),
        });
        tokio::spawn(CacheInner::background_update_loop(inner.clone()));
        Self { inner, _stop: token.drop_guard() }
    }

    pub fn backend(&self) -> &Arc<dyn ServiceGraphBackend> {
        &self.inner.backend
    }

    /// Number of cached windows.
    pub fn cache_size(&self) -> usize {
        self.inner.lock_state().entries.len()
    }

    /// Raw data for a window, populating it if needed.
    ///
    /// Waits for the population for at most `deadline`. Neither the deadline nor `cancel` abort the population
    /// itself, so a later request for the same window picks up where this one gave up.
    pub async fn get(
        &self,
        key: CacheKey,
        force_refresh: bool,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<CacheData>> {
        let start = Instant::now();
        let (id, data) = {
            let mut state = self.inner.lock_state();
            let (id, data) = match state.entries.get(&key) {
                None => {
                    debug!("Creating new cache entry: {}", key);
                    let id = self.inner.new_entry(&mut state, &key);
                    (id, state.entries.get(&key).map(|e| e.data.clone()))
                }
                Some(entry) if force_refresh => {
                    debug!("Forced update requested: {}", key);
                    let id = entry.id;
                    self.inner.start_update(&mut state, &key);
                    (id, state.entries.get(&key).and_then(|e| e.update.clone()))
                }
                Some(entry) => {
                    debug!("Using existing cache entry: {}", key);
                    (entry.id, Some(entry.data.clone()))
                }
            };
            let Some(data) = data else {
                return Err(ServiceGraphError::Internal { message: format!("cache entry {} vanished", key) });
            };
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.requests += 1;
            }
            (id, data)
        };

        let _request = RequestGuard { inner: &self.inner, key: &key, id };

        let populated = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Request cancelled before it was fulfilled: {}", key);
                return Err(ServiceGraphError::Cancelled);
            }
            _ = tokio::time::sleep(deadline) => {
                info!("Request timed out waiting on population of {}", key);
                return Err(ServiceGraphError::cache_timeout(data.created.elapsed()));
            }
            populated = data.wait() => populated,
        };

        let result = populated
            .ok_or_else(|| ServiceGraphError::Internal { message: format!("population of {} never completed", key) })
            .and_then(PopulatedData::usable);
        debug!("Raw data request for {} took {:?}", key, start.elapsed());
        result?;
        Ok(data)
    }

    /// Raw data for the request window, keyed on the request cluster and time range.
    pub async fn get_raw_data(&self, request: &ServiceGraphRequest, cancel: &CancellationToken) -> Result<Arc<CacheData>> {
        let key = CacheKey::new(&request.cluster, &request.time_range);
        self.get(key, request.force_refresh, request.timeout, cancel).await
    }

    /// Raw data filtered for the requesting user, with host names converted and service groups computed.
    ///
    /// The permissions, the host naming and the raw data are fetched concurrently. Errors are reported in that
    /// order.
    pub async fn get_filtered_service_graph_data(
        &self,
        request: &ServiceGraphRequest,
        cancel: &CancellationToken,
    ) -> Result<ServiceGraphData> {
        debug!("Filtered service graph data requested for {:?}", request.time_range);
        let backend = &self.inner.backend;
        let (rbac, names, raw) = tokio::join!(
            backend.new_rbac_filter(&request.cluster),
            backend.new_name_helper(&request.cluster, &request.view.host_aggregation_selectors),
            self.get_raw_data(request, cancel),
        );

        let rbac = rbac.inspect_err(|err| error!("Failed to load user permissions: {}", err))?;
        let names = names.inspect_err(|err| error!("Failed to load name mappings: {}", err))?;
        let raw = raw.inspect_err(|err| warn!("Failed to load raw graph data: {}", err))?;

        let populated = raw
            .result()
            .ok_or_else(|| ServiceGraphError::Internal { message: "raw data not populated".to_string() })?;
        Ok(ServiceGraphData::filter(populated, raw.time_range.clone(), rbac.as_ref(), names))
    }

    /// Warms the cache with the default window for each cluster.
    pub async fn prefetch(&self, clusters: &[String]) {
        info!("🔥 Prefetching raw data for {} cluster(s)", clusters.len());
        let deadline = Instant::now() + Duration::from_secs(PREFETCH_DEADLINE_SECS);
        let cancel = CancellationToken::new();

        for cluster in clusters {
            let key = CacheKey::relative_window(cluster, PREFETCH_WINDOW_SECS);
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.get(key, false, remaining, &cancel).await {
                Ok(_) => info!("Prefetched raw data for cluster {}", cluster),
                Err(err) => info!("Skipped prefetch for cluster {}: {}", cluster, err),
            }
        }
    }
}

/// Decrements the request count and refreshes the access position when a request finishes, however it finishes.
struct RequestGuard<'a> {
    inner: &'a CacheInner,
    key: &'a CacheKey,
    id: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        let Some(entry) = state.entries.get_mut(self.key) else {
            return;
        };
        if entry.id != self.id {
            return;
        }
        entry.requests = entry.requests.saturating_sub(1);
        state.touch(self.key, Instant::now());
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an entry and starts its first population. The first population is also the entry's data.
    fn new_entry(self: &Arc<Self>, state: &mut CacheState, key: &CacheKey) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = CacheData::new(key);
        let entry = CacheEntry {
            id,
            key: key.clone(),
            token: self.token.child_token(),
            requests: 0,
            accessed: Instant::now(),
            data: data.clone(),
            update: None,
        };
        state.entries.insert(key.clone(), entry);
        self.spawn_population(state, key, data);
        id
    }

    /// Ensures a population is in flight for the entry.
    fn start_update(self: &Arc<Self>, state: &mut CacheState, key: &CacheKey) {
        let Some(entry) = state.entries.get(key) else {
            return;
        };
        if entry.update.is_some() {
            return;
        }
        debug!("Triggering update: {}", key);
        self.spawn_population(state, key, CacheData::new(key));
    }

    fn spawn_population(self: &Arc<Self>, state: &mut CacheState, key: &CacheKey, data: Arc<CacheData>) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.update = Some(data.clone());
        let token = entry.token.clone();
        let inner = self.clone();
        let key = key.clone();

        tokio::spawn(async move {
            let populated = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Population cancelled: {}", key);
                    PopulatedData::failed(ServiceGraphError::Cancelled)
                }
                populated = inner.populate(&key.cluster, &data.time_range) => populated,
            };
            data.complete(populated);
            inner.finish_update(&key, &data);
        });
    }

    /// Swaps in a completed population and drops entries that should not be served again.
    fn finish_update(&self, key: &CacheKey, data: &Arc<CacheData>) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.update.as_ref().is_some_and(|u| Arc::ptr_eq(u, data)) {
                if data.result().is_some_and(|r| r.err.is_none()) {
                    entry.data = data.clone();
                }
                entry.update = None;

                // Truncated data is kept so clients do not keep re-triggering the same capped query. Data without
                // flows renders an empty graph, so it is not kept either.
                let discard = entry.data.result().is_some_and(|r| r.errored() || r.l3.is_empty());
                if discard {
                    debug!("Discarding cache entry after population: {}", key);
                    state.entries.shift_remove(key);
                }
            }
        }
        self.tidy(&mut state, Instant::now());
    }

    /// Ages out entries and trims the cache to size.
    fn tidy(&self, state: &mut CacheState, now: Instant) {
        let slow_query_age_out = self.config.slow_query_entry_age_out();
        let polled_age_out = self.config.polled_entry_age_out();
        let max_truncated_age = self.config.max_truncated_entry_age();

        state.entries.retain(|key, entry| {
            let idle = now.saturating_duration_since(entry.accessed);
            if entry.data.is_pending() && entry.requests == 0 && idle > slow_query_age_out {
                info!("Removing aged out unpopulated cache entry and cancelling query: {}", key);
                entry.token.cancel();
                return false;
            }
            if entry.key.relative && idle > polled_age_out {
                debug!("Removing aged out cache entry: {}", key);
                return false;
            }
            let truncated = entry.data.result().is_some_and(PopulatedData::truncated);
            if truncated && entry.requests == 0 && now.saturating_duration_since(entry.data.created) > max_truncated_age {
                debug!("Removing aged out truncated cache entry: {}", key);
                return false;
            }
            true
        });

        let mut idx = 0;
        while state.entries.len() > self.config.max_entries && idx < state.entries.len() {
            let removable = state.entries.get_index(idx).is_some_and(|(_, e)| e.requests == 0);
            if removable {
                if let Some((key, _)) = state.entries.shift_remove_index(idx) {
                    debug!("Removing cache entry to keep cache size maintained: {}", key);
                }
            } else {
                idx += 1;
            }
        }
    }

    async fn background_update_loop(inner: Arc<CacheInner>) {
        let loop_interval = inner.config.poll_loop_interval();
        let mut loop_ticker = JitterTicker::new(loop_interval);
        let mut query_ticker = JitterTicker::new(inner.config.poll_query_interval());

        loop {
            tokio::select! {
                _ = inner.token.cancelled() => return,
                _ = loop_ticker.tick() => debug!("Starting cache update cycle"),
            }

            let now = Instant::now();
            let recent = loop_interval / 2;
            let settle_cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(inner.config.data_settle_time()).unwrap_or_else(|_| chrono::Duration::zero());

            let to_update: Vec<CacheKey> = {
                let mut state = inner.lock_state();
                inner.tidy(&mut state, now);
                state
                    .entries
                    .values()
                    .filter(|e| e.needs_updating(now, recent, settle_cutoff))
                    .map(|e| e.key.clone())
                    .collect()
            };

            // One update per query tick so the backend is not hit with every refresh at once.
            for key in to_update {
                tokio::select! {
                    _ = inner.token.cancelled() => return,
                    _ = query_ticker.tick() => {}
                }
                let mut state = inner.lock_state();
                let needs_update =
                    state.entries.get(&key).is_some_and(|e| e.needs_updating(now, recent, settle_cutoff));
                if needs_update {
                    inner.start_update(&mut state, &key);
                }
            }

            debug!("Finished cache update cycle");
        }
    }

    /// Runs the backend queries for one window. The flow config is needed to normalise the flow data, so it is
    /// fetched first and the remaining queries run concurrently.
    async fn populate(&self, cluster: &str, time_range: &TimeRange) -> PopulatedData {
        debug!("Populating data for {} {:?}", cluster, time_range);
        let backend = &self.backend;

        let flow_config = match backend.get_flow_config(cluster).await {
            Ok(config) => config,
            Err(err) => {
                error!("Failed to get flow configuration: {}", err);
                return PopulatedData::failed(err);
            }
        };

        let (l3, l7, dns, events, service_labels, replica_sets, stateful_sets, daemon_sets, pods) = tokio::join!(
            backend.get_l3_flow_data(cluster, time_range, &flow_config),
            backend.get_l7_flow_data(cluster, time_range, &flow_config),
            backend.get_dns_data(cluster, time_range, &flow_config),
            backend.get_events(cluster, time_range),
            backend.get_service_labels(cluster),
            backend.get_replica_set_labels(cluster),
            backend.get_stateful_set_labels(cluster),
            backend.get_daemon_set_labels(cluster),
            backend.get_pod_labels(cluster),
        );

        let mut err: Option<ServiceGraphError> = None;
        let mut data = PopulatedData::default();
        data.l3 = fetched(l3, "L3 logs", &mut err);
        data.l7 = fetched(l7, "L7 logs", &mut err);
        data.dns = fetched(dns, "DNS logs", &mut err);
        data.events = fetched(events, "events", &mut err);
        data.service_labels = labels(service_labels, "service labels", &mut err);
        for (result, what) in [
            (replica_sets, "replica set labels"),
            (stateful_sets, "stateful set labels"),
            (daemon_sets, "daemon set labels"),
            (pods, "pod labels"),
        ] {
            data.resource_labels.extend(labels(result, what, &mut err));
        }
        data.err = err;

        debug!(
            "Populated {} {:?}: {} L3 flows, {} L7 flows, {} DNS logs, {} events, truncated={}",
            cluster,
            time_range,
            data.l3.len(),
            data.l7.len(),
            data.dns.len(),
            data.events.len(),
            data.truncated()
        );
        data
    }
}

fn record_error(err: ServiceGraphError, what: &str, first: &mut Option<ServiceGraphError>) {
    if err.is_truncated() {
        warn!("Query for {} was truncated", what);
    } else {
        error!("Failed to get {}: {}", what, err);
    }
    first.get_or_insert(err);
}

fn fetched<T: Default>(result: Result<Fetched<T>>, what: &str, first: &mut Option<ServiceGraphError>) -> T {
    match result {
        Ok(fetched) => {
            if fetched.truncated {
                record_error(ServiceGraphError::DataTruncated, what, first);
            }
            fetched.items
        }
        Err(err) => {
            record_error(err, what, first);
            T::default()
        }
    }
}

fn labels(result: Result<LabelMap>, what: &str, first: &mut Option<ServiceGraphError>) -> LabelMap {
    result.unwrap_or_else(|err| {
        record_error(err, what, first);
        LabelMap::new()
    })
}
