use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::key::CacheKey;
use crate::errors::ServiceGraphError;
use crate::flows::{DnsLog, Event, L3Flow, L7Flow, LabelMap};
use crate::graph::TimeRange;

/// Raw data gathered by one population. Partial results are kept alongside any error.
#[derive(Debug, Clone, Default)]
pub struct PopulatedData {
    pub err: Option<ServiceGraphError>,
    pub l3: Vec<L3Flow>,
    pub l7: Vec<L7Flow>,
    pub dns: Vec<DnsLog>,
    pub events: Vec<Event>,
    pub service_labels: LabelMap,
    pub resource_labels: LabelMap,
}

impl PopulatedData {
    pub fn failed(err: ServiceGraphError) -> Self {
        Self { err: Some(err), ..Default::default() }
    }

    pub fn truncated(&self) -> bool {
        self.err.as_ref().is_some_and(ServiceGraphError::is_truncated)
    }

    /// Failed for a reason other than truncation.
    pub fn errored(&self) -> bool {
        self.err.as_ref().is_some_and(|err| !err.is_truncated())
    }

    /// Whether the data can be served. Truncated data is usable as long as some L3 data arrived.
    pub fn usable(&self) -> Result<(), ServiceGraphError> {
        match &self.err {
            Some(err) if !err.is_truncated() || self.l3.is_empty() => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

/// One population of a cache entry. Written exactly once, then read without locking.
#[derive(Debug)]
pub struct CacheData {
    pub created: Instant,
    pub created_at: DateTime<Utc>,
    pub time_range: TimeRange,
    result: OnceLock<PopulatedData>,
    done: watch::Sender<bool>,
}

impl CacheData {
    pub fn new(key: &CacheKey) -> Arc<Self> {
        let created_at = Utc::now();
        Arc::new(Self {
            created: Instant::now(),
            created_at,
            time_range: key.time_range(created_at),
            result: OnceLock::new(),
            done: watch::channel(false).0,
        })
    }

    pub fn complete(&self, data: PopulatedData) {
        if self.result.set(data).is_ok() {
            self.done.send_replace(true);
        }
    }

    pub fn result(&self) -> Option<&PopulatedData> {
        self.result.get()
    }

    pub fn is_pending(&self) -> bool {
        self.result.get().is_none()
    }

    /// Waits for the population to finish.
    pub async fn wait(&self) -> Option<&PopulatedData> {
        let mut done = self.done.subscribe();
        // The sender lives as long as self, so this only returns once completed.
        let _ = done.wait_for(|done| *done).await;
        self.result.get()
    }
}

/// A cached window. `data` is what requests are served from; `update` is the population in flight, if any.
#[derive(Debug)]
pub struct CacheEntry {
    pub id: u64,
    pub key: CacheKey,
    /// Child of the cache token. Cancelled when the entry is dropped as a slow query.
    pub token: CancellationToken,
    pub requests: usize,
    pub accessed: Instant,
    pub data: Arc<CacheData>,
    pub update: Option<Arc<CacheData>>,
}

impl CacheEntry {
    /// Whether the background loop should refresh this entry.
    ///
    /// Errored data always refreshes. Recently created data never does. Relative windows refresh every cycle,
    /// absolute windows only while their end is within the settle time.
    pub fn needs_updating(
        &self,
        now: Instant,
        recent: Duration,
        settle_cutoff: DateTime<Utc>,
    ) -> bool {
        if self.update.is_some() {
            return false;
        }
        let Some(result) = self.data.result() else {
            return false;
        };
        if result.err.is_some() {
            true
        } else if now.saturating_duration_since(self.data.created) < recent {
            false
        } else if self.key.relative {
            true
        } else {
            self.key.end_time() > settle_cutoff
        }
    }
}
