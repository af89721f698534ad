use std::path::PathBuf;
use std::time::Duration;

use crate::tier::ProtocolTier;

pub const DEFAULT_BRANCH: &str = "4";
pub const DEFAULT_PRODUCT: &str = "standard";

/// Per-call socket timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Revision probes, lock markers, differential service calls.
    pub control: Duration,
    /// Bulk payload transfers.
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(10),
            transfer: Duration::from_secs(25),
        }
    }
}

/// Fixed bounds used by the mirror selector and the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    /// A mirror at or above this score is skipped.
    pub failure_threshold: u32,
    /// More added packages than this and the differential tier gives up.
    pub differential_threshold: usize,
    pub batch_size: usize,
    pub batch_attempts: u32,
    /// In-place retries for a fetch that timed out.
    pub timeout_retries: u32,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            failure_threshold: 30,
            differential_threshold: 300,
            batch_size: 12,
            batch_attempts: 5,
            timeout_retries: 50,
        }
    }
}

/// Immutable global knobs for one sync invocation.
///
/// Built once at startup and handed to every component by reference.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub branch: String,
    pub product: String,
    pub arch: String,
    /// Pins tier 1 and downloads the full database.
    pub developer_mode: bool,
    /// Explicit tier override. Disables developer mode when set.
    pub forced_tier: Option<ProtocolTier>,
    /// Sync even when the local revision matches the remote one.
    pub force: bool,
    /// Check repository signatures when a verifier is available.
    pub gpg: bool,
    pub timeouts: Timeouts,
    pub limits: SyncLimits,
    /// How often the download lock is re-checked during long transfers.
    pub lock_poll_interval: Duration,
    /// Wait before re-checking a repository that reported itself locked mid-session.
    pub locked_retry_delay: Duration,
    /// Running from removable or live media: only tier 1 is used.
    pub live_media: bool,
    /// Passed to post-update hooks.
    pub system_root: PathBuf,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH.to_string(),
            product: DEFAULT_PRODUCT.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            developer_mode: false,
            forced_tier: None,
            force: false,
            gpg: true,
            timeouts: Timeouts::default(),
            limits: SyncLimits::default(),
            lock_poll_interval: Duration::from_secs(30),
            locked_retry_delay: Duration::from_secs(5),
            live_media: false,
            system_root: PathBuf::from("/"),
        }
    }
}

impl SyncSettings {
    /// Apply a tier override. A forced tier always wins over developer mode.
    pub fn with_forced_tier(mut self, tier: Option<ProtocolTier>) -> Self {
        self.forced_tier = tier;
        if tier.is_some() {
            self.developer_mode = false;
        }
        self
    }

    /// Developer mode as it applies to this run.
    pub fn effective_developer_mode(&self) -> bool {
        self.developer_mode && self.forced_tier.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_bounds() {
        let settings = SyncSettings::default();
        assert_eq!(settings.branch, "4");
        assert_eq!(settings.product, "standard");
        assert_eq!(settings.limits.failure_threshold, 30);
        assert_eq!(settings.limits.differential_threshold, 300);
        assert_eq!(settings.limits.batch_size, 12);
        assert_eq!(settings.limits.batch_attempts, 5);
        assert_eq!(settings.limits.timeout_retries, 50);
    }

    #[test]
    fn forced_tier_disables_developer_mode() {
        let settings = SyncSettings {
            developer_mode: true,
            ..Default::default()
        }
        .with_forced_tier(Some(ProtocolTier::CompressedDump));
        assert!(!settings.developer_mode);
        assert!(!settings.effective_developer_mode());

        let settings = SyncSettings {
            developer_mode: true,
            ..Default::default()
        }
        .with_forced_tier(None);
        assert!(settings.effective_developer_mode());
    }
}
