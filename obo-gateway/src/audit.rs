//! Bounded in-memory audit trail.
//!
//! Every security-relevant operation in the core produces an [`AuditEntry`].
//! The service retains a bounded ring of entries; evicted batches and the
//! final drain on shutdown are handed to an [`AuditSink`] so an external
//! store can persist them.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use smol_str::SmolStr;
use thiserror::Error;
use time::OffsetDateTime;
use typed_builder::TypedBuilder;

use crate::task::{BackgroundTask, ShutdownToken};

pub const AUDIT_SCHEMA_VERSION: u32 = 1;

const DEFAULT_RETENTION: usize = 10_000;

/// `layer:component` tag identifying the emitter of an entry.
///
/// Audit integrity is not best-effort: entries without a well-formed source
/// are rejected at the logging boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditSource(SmolStr);

impl AuditSource {
    pub fn parse(value: &str) -> Result<Self, AuditError> {
        let Some((layer, component)) = value.split_once(':') else {
            return Err(AuditError::BadSource {
                value: SmolStr::new(value),
            });
        };

        let layer_ok = !layer.is_empty() && layer.chars().all(|c| c.is_ascii_lowercase());
        let component_ok =
            !component.is_empty() && component.chars().all(|c| c.is_ascii_lowercase() || c == '-');

        if layer_ok && component_ok {
            Ok(Self(SmolStr::new(value)))
        } else {
            Err(AuditError::BadSource {
                value: SmolStr::new(value),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit source `{value}` is not a `layer:component` tag")]
    BadSource { value: SmolStr },
    #[error("audit entry is missing its source tag")]
    MissingSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct AuditEntry {
    #[builder(default = AUDIT_SCHEMA_VERSION)]
    pub schema_version: u32,

    #[builder(default = OffsetDateTime::now_utc())]
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    /// Emitter tag; stamped by the delegation registry when a module
    /// returned a trail without one.
    #[builder(default, setter(strip_option))]
    pub source: Option<AuditSource>,

    #[builder(setter(into))]
    pub user_id: String,

    #[builder(setter(into))]
    pub action: String,

    #[builder(default, setter(strip_option, into))]
    pub resource: Option<String>,

    pub success: bool,

    #[builder(default, setter(strip_option, into))]
    pub error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Receives evicted batches and the final drain.
///
/// Implementations must not block for long: `write` is invoked while the
/// ring lock is *not* held, but from latency-sensitive request paths.
pub trait AuditSink: Send + Sync {
    fn write(&self, entries: &[AuditEntry]);
}

/// Sink that discards everything.
pub struct NoopSink;

impl AuditSink for NoopSink {
    fn write(&self, _entries: &[AuditEntry]) {}
}

#[derive(Clone)]
pub struct AuditConfig {
    pub retention: usize,
    pub sink: Option<Arc<dyn AuditSink>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            sink: None,
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

/// Bounded audit log.
///
/// A service constructed with [`AuditService::disabled`] accepts calls and
/// drops entries, so call sites never need to branch on configuration.
pub struct AuditService {
    inner: Option<Inner>,
}

struct Inner {
    ring: Mutex<VecDeque<AuditEntry>>,
    retention: usize,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditService {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            inner: Some(Inner {
                ring: Mutex::new(VecDeque::with_capacity(config.retention.min(1024))),
                retention: config.retention.max(1),
                sink: config.sink,
            }),
        }
    }

    /// Null-object variant: accepts entries and drops them silently.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Appends an entry, evicting the oldest batch through the sink when the
    /// retention bound is reached.
    pub fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if entry.source.is_none() {
            return Err(AuditError::MissingSource);
        }

        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let evicted = {
            let mut ring = inner.ring.lock();

            let evicted = if ring.len() >= inner.retention {
                // Evict in their original order, before they become unreachable.
                let overflow = ring.len() + 1 - inner.retention;
                ring.drain(..overflow).collect::<Vec<_>>()
            } else {
                Vec::new()
            };

            ring.push_back(entry);

            evicted
        };

        if !evicted.is_empty()
            && let Some(sink) = &inner.sink
        {
            sink.write(&evicted);
        }

        Ok(())
    }

    /// Convenience wrapper used on paths where a malformed entry is a
    /// programming error rather than caller input.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(error) = self.log(entry) {
            error!(%error, "Rejected audit entry");
        }
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let Some(inner) = &self.inner else {
            return Vec::new();
        };

        let ring = inner.ring.lock();

        let matches = ring.iter().filter(|entry| {
            query.user_id.as_deref().is_none_or(|id| entry.user_id == id)
                && query.action.as_deref().is_none_or(|action| entry.action == action)
                && query.success.is_none_or(|success| entry.success == success)
        });

        match query.limit {
            Some(limit) => matches.rev().take(limit).cloned().collect(),
            None => matches.cloned().collect(),
        }
    }

    /// Removes and returns every retained entry.
    pub fn drain(&self) -> Vec<AuditEntry> {
        match &self.inner {
            Some(inner) => inner.ring.lock().drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.ring.lock().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sink(&self) -> Option<Arc<dyn AuditSink>> {
        self.inner.as_ref()?.sink.clone()
    }
}

/// Drains the retained entries into the sink on graceful shutdown.
pub struct AuditFlushTask {
    pub audit: Arc<AuditService>,
}

#[async_trait]
impl BackgroundTask for AuditFlushTask {
    type Output = anyhow::Result<()>;

    const LABEL: &'static str = "audit flush";

    async fn run(self, mut stop: ShutdownToken) -> Self::Output {
        stop.triggered().await;

        let entries = self.audit.drain();

        if entries.is_empty() {
            return Ok(());
        }

        if let Some(sink) = self.audit.sink() {
            debug!(count = entries.len(), "Flushing audit entries");
            sink.write(&entries);
        }

        Ok(())
    }
}
