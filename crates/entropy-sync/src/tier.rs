use std::fmt;

/// Synchronization protocol level ("EAPI") used for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolTier {
    /// Raw (light) database file.
    LightDatabase = 1,
    /// Compressed SQL dump of the light database.
    CompressedDump = 2,
    /// Session-based differential updates.
    Differential = 3,
}

impl ProtocolTier {
    pub const HIGHEST: Self = Self::Differential;

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::LightDatabase),
            2 => Some(Self::CompressedDump),
            3 => Some(Self::Differential),
            _ => None,
        }
    }

    /// Parse an explicit tier override such as the `FORCE_EAPI` environment value.
    pub fn parse_override(value: &str) -> Option<Self> {
        value.trim().parse::<u8>().ok().and_then(Self::from_level)
    }

    pub fn is_bulk(self) -> bool {
        !matches!(self, Self::Differential)
    }
}

impl fmt::Display for ProtocolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EAPI{}", self.level())
    }
}

/// Tiers attempted for one repository within one pass.
///
/// The effective tier never rises: `downgrade` refuses anything that is not
/// strictly lower than the current tier, so every tier appears at most once.
#[derive(Debug, Clone)]
pub struct TierLadder {
    current: ProtocolTier,
    attempted: Vec<ProtocolTier>,
}

impl TierLadder {
    pub fn new(start: ProtocolTier) -> Self {
        Self {
            current: start,
            attempted: Vec::new(),
        }
    }

    pub fn current(&self) -> ProtocolTier {
        self.current
    }

    /// Record that the current tier is being tried.
    pub fn attempt(&mut self) -> ProtocolTier {
        if self.attempted.last() != Some(&self.current) {
            self.attempted.push(self.current);
        }
        self.current
    }

    /// Move to a strictly lower tier. Returns `false` and leaves the ladder
    /// untouched otherwise.
    pub fn downgrade(&mut self, to: ProtocolTier) -> bool {
        if to >= self.current {
            return false;
        }
        tracing::debug!(from = %self.current, to = %to, "downgrading protocol tier");
        self.current = to;
        true
    }

    pub fn attempted(&self) -> &[ProtocolTier] {
        &self.attempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_parsing() {
        assert_eq!(ProtocolTier::parse_override("3"), Some(ProtocolTier::Differential));
        assert_eq!(ProtocolTier::parse_override(" 1\n"), Some(ProtocolTier::LightDatabase));
        assert_eq!(ProtocolTier::parse_override("4"), None);
        assert_eq!(ProtocolTier::parse_override("two"), None);
    }

    #[test]
    fn ladder_never_upgrades() {
        let mut ladder = TierLadder::new(ProtocolTier::CompressedDump);
        ladder.attempt();
        assert!(!ladder.downgrade(ProtocolTier::Differential));
        assert!(!ladder.downgrade(ProtocolTier::CompressedDump));
        assert_eq!(ladder.current(), ProtocolTier::CompressedDump);
        assert!(ladder.downgrade(ProtocolTier::LightDatabase));
        ladder.attempt();
        assert!(!ladder.downgrade(ProtocolTier::LightDatabase));
        assert_eq!(
            ladder.attempted(),
            &[ProtocolTier::CompressedDump, ProtocolTier::LightDatabase]
        );
    }

    #[test]
    fn repeated_attempts_are_recorded_once() {
        let mut ladder = TierLadder::new(ProtocolTier::Differential);
        ladder.attempt();
        ladder.attempt();
        assert!(ladder.downgrade(ProtocolTier::LightDatabase));
        ladder.attempt();
        let tiers = ladder.attempted();
        assert_eq!(tiers, &[ProtocolTier::Differential, ProtocolTier::LightDatabase]);
        assert!(tiers.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn display_uses_eapi_level() {
        assert_eq!(ProtocolTier::Differential.to_string(), "EAPI3");
        assert!(ProtocolTier::LightDatabase.is_bulk());
        assert!(!ProtocolTier::Differential.is_bulk());
    }
}
