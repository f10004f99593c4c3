//! Convergence primitives for listener reconciliation.
//!
//! The forwarder keeps a set of active listeners and repeatedly converges it
//! toward a desired set of ports. This library holds the pieces of that loop
//! that carry no I/O:
//!
//! - **Outcomes**: how a single port update was classified.
//! - **Reports**: the per-port classification of a whole reconciliation pass.
//! - **Diffing**: which currently active ports fall out of the desired set.
//! - **Fingerprints**: deterministic hashes of desired configuration, used to
//!   detect when a reload actually changes anything.
//!
//! # Invariants
//!
//! - A port is classified at most once per pass
//! - Decisions are deterministic given the same inputs
//! - Revisions only advance on a changed fingerprint

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The same port was classified twice in one pass.
    #[error("port {port} already classified as {existing}")]
    DuplicatePort { port: u16, existing: &'static str },
}

/// Outcome of updating a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOutcome {
    /// No listener existed; one was started.
    New,
    /// A listener existed with a different target or config and was replaced.
    Replaced,
    /// A listener existed with identical target and config; nothing changed.
    Unchanged,
}

impl UpdateOutcome {
    /// Stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Replaced => "replaced",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of every port touched by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSetReport {
    pub new: BTreeSet<u16>,
    pub removed: BTreeSet<u16>,
    pub replaced: BTreeSet<u16>,
    pub unchanged: BTreeSet<u16>,
}

impl PortSetReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of updating `port`.
    pub fn record(&mut self, port: u16, outcome: UpdateOutcome) -> Result<(), ReconcileError> {
        self.ensure_unclassified(port)?;
        match outcome {
            UpdateOutcome::New => self.new.insert(port),
            UpdateOutcome::Replaced => self.replaced.insert(port),
            UpdateOutcome::Unchanged => self.unchanged.insert(port),
        };
        Ok(())
    }

    /// Record that `port` was stopped because it is no longer desired.
    pub fn record_removed(&mut self, port: u16) -> Result<(), ReconcileError> {
        self.ensure_unclassified(port)?;
        self.removed.insert(port);
        Ok(())
    }

    fn ensure_unclassified(&self, port: u16) -> Result<(), ReconcileError> {
        let existing = if self.new.contains(&port) {
            "new"
        } else if self.replaced.contains(&port) {
            "replaced"
        } else if self.unchanged.contains(&port) {
            "unchanged"
        } else if self.removed.contains(&port) {
            "removed"
        } else {
            return Ok(());
        };
        Err(ReconcileError::DuplicatePort { port, existing })
    }

    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }

    /// Number of ports whose listener was started, replaced or stopped.
    pub fn changed_count(&self) -> usize {
        self.new.len() + self.removed.len() + self.replaced.len()
    }

    /// Ports that are listening once the pass completes.
    pub fn active_ports(&self) -> BTreeSet<u16> {
        self.new
            .iter()
            .chain(self.replaced.iter())
            .chain(self.unchanged.iter())
            .copied()
            .collect()
    }
}

/// Ports present in `current` but absent from `desired`.
pub fn stale_ports<C, D>(current: C, desired: D) -> BTreeSet<u16>
where
    C: IntoIterator<Item = u16>,
    D: IntoIterator<Item = u16>,
{
    let desired: BTreeSet<u16> = desired.into_iter().collect();
    current
        .into_iter()
        .filter(|port| !desired.contains(port))
        .collect()
}

/// A configuration fingerprint for deterministic comparison.
///
/// Used to detect when a reloaded configuration actually differs from the
/// one last applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// The last configuration revision that was successfully applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revision {
    /// Fingerprint of the applied configuration.
    pub fingerprint: Option<Fingerprint>,

    /// Number of revisions applied so far.
    pub generation: u64,

    /// When the revision was applied.
    pub applied_at: Option<DateTime<Utc>>,
}

impl Revision {
    /// A revision with nothing applied yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `fingerprint` is the one already applied.
    pub fn is_current(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprint.as_ref() == Some(fingerprint)
    }

    /// Advance to `fingerprint`.
    ///
    /// Returns false (and leaves the revision untouched) if it is already current.
    pub fn advance(&mut self, fingerprint: Fingerprint) -> bool {
        if self.is_current(&fingerprint) {
            return false;
        }
        self.fingerprint = Some(fingerprint);
        self.generation += 1;
        self.applied_at = Some(Utc::now());
        true
    }
}
