use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// How badly a mirror failed, mapped to a score penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    ChecksumMismatch,
    NotFound,
    Other,
    /// Timeouts are retried in place and cost nothing.
    Timeout,
}

impl FailureSeverity {
    pub fn penalty(self) -> u32 {
        match self {
            Self::ChecksumMismatch => 1,
            Self::NotFound => 3,
            Self::Other => 5,
            Self::Timeout => 0,
        }
    }
}

/// Score kept for one mirror URI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorScore {
    pub score: u32,
    /// Quarantined and decaying back toward rotation.
    #[serde(default)]
    pub cooldown: bool,
}

/// Failure scores shared by every rotation in one process.
#[derive(Debug)]
pub struct MirrorScores {
    threshold: u32,
    scores: Mutex<HashMap<String, MirrorScore>>,
}

const QUARANTINE_JUMP: u32 = 15;
const QUARANTINE_DECAY: u32 = 4;

impl MirrorScores {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn score(&self, uri: &str) -> MirrorScore {
        self.scores.lock().get(uri).copied().unwrap_or_default()
    }

    /// Eligibility check with quarantine bookkeeping.
    ///
    /// A mirror reaching the threshold jumps to threshold + 15; each later
    /// check decays it by 4 until it falls back to the threshold, at which
    /// point it is reset to 0 and re-enters rotation.
    pub fn check(&self, uri: &str) -> bool {
        let mut scores = self.scores.lock();
        let entry = scores.entry(uri.to_string()).or_default();
        if entry.cooldown {
            entry.score = entry.score.saturating_sub(QUARANTINE_DECAY);
            if entry.score <= self.threshold {
                tracing::debug!(mirror = uri, "mirror leaves quarantine");
                *entry = MirrorScore::default();
                return true;
            }
            return false;
        }
        if entry.score >= self.threshold {
            tracing::info!(mirror = uri, score = entry.score, "quarantining mirror");
            entry.score = self.threshold + QUARANTINE_JUMP;
            entry.cooldown = true;
            return false;
        }
        true
    }

    pub fn record_failure(&self, uri: &str, severity: FailureSeverity) {
        let mut scores = self.scores.lock();
        let entry = scores.entry(uri.to_string()).or_default();
        entry.score = entry.score.saturating_add(severity.penalty());
        tracing::debug!(mirror = uri, ?severity, score = entry.score, "mirror failure");
    }

    pub fn record_success(&self, uri: &str) {
        let mut scores = self.scores.lock();
        if let Some(entry) = scores.get_mut(uri) {
            entry.score = entry.score.saturating_sub(1);
        }
    }

    /// Quarantine bookkeeping for one repository pass: every mirror is
    /// checked exactly once, however often it is looked at afterwards.
    pub fn begin_pass(&self, mirrors: &[String]) {
        for uri in mirrors {
            self.check(uri);
        }
    }

    /// Usable right now. No bookkeeping.
    pub fn is_eligible(&self, uri: &str) -> bool {
        let score = self.score(uri);
        !score.cooldown && score.score < self.threshold
    }

    /// First eligible mirror in priority order.
    pub fn first_eligible<'a>(&self, mirrors: &'a [String]) -> Option<&'a str> {
        mirrors
            .iter()
            .map(String::as_str)
            .find(|uri| self.is_eligible(uri))
    }

    /// A single pass over `mirrors` in priority order.
    pub fn rotation(&self, mirrors: &[String]) -> MirrorRotation<'_> {
        MirrorRotation {
            scores: self,
            remaining: mirrors.iter().cloned().collect(),
            failed: HashSet::new(),
        }
    }

    /// Load persisted scores. A missing file yields an empty table.
    pub fn load(path: &Path, threshold: u32) -> Result<Self, SyncError> {
        let table = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring unreadable mirror scores: {e}");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(SyncError::local(path, e)),
        };
        Ok(Self {
            threshold,
            scores: Mutex::new(table),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        let json = {
            let scores = self.scores.lock();
            serde_json::to_string_pretty(&*scores)
                .map_err(|e| SyncError::local(path, std::io::Error::other(e)))?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::local(parent, e))?;
        }
        std::fs::write(path, json).map_err(|e| SyncError::local(path, e))
    }
}

/// One pass over a repository's mirrors. Each mirror is offered at most once
/// and is charged at most once for failing.
pub struct MirrorRotation<'a> {
    scores: &'a MirrorScores,
    remaining: VecDeque<String>,
    failed: HashSet<String>,
}

impl MirrorRotation<'_> {
    /// Next eligible mirror, or `None` when every mirror is exhausted.
    pub fn next_mirror(&mut self) -> Option<String> {
        while let Some(uri) = self.remaining.pop_front() {
            if self.scores.is_eligible(&uri) {
                return Some(uri);
            }
            tracing::debug!(mirror = %uri, "skipping mirror above failure threshold");
        }
        None
    }

    pub fn record_failure(&mut self, uri: &str, severity: FailureSeverity) {
        if self.failed.insert(uri.to_string()) {
            self.scores.record_failure(uri, severity);
        }
    }

    pub fn record_success(&mut self, uri: &str) {
        self.scores.record_success(uri);
    }
}
