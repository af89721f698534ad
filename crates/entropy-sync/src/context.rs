use crate::artifact::ArtifactSet;
use crate::feedback::Feedback;
use crate::repository::RepositoryDescriptor;
use crate::tier::{ProtocolTier, TierLadder};

/// State carried through one repository's pass.
///
/// Each step takes the context explicitly; nothing about the pass lives in
/// engine fields.
#[derive(Debug)]
pub struct SyncContext {
    pub repo: RepositoryDescriptor,
    pub tiers: TierLadder,
    /// Revision advertised by the mirror, when the probe succeeded.
    pub remote_revision: Option<u64>,
    pub artifacts: ArtifactSet,
    pub feedback: Vec<Feedback>,
}

impl SyncContext {
    pub fn new(repo: RepositoryDescriptor, start: ProtocolTier) -> Self {
        Self {
            repo,
            tiers: TierLadder::new(start),
            remote_revision: None,
            artifacts: ArtifactSet::new(),
            feedback: Vec::new(),
        }
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.feedback.push(Feedback::info(msg));
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(repository = %self.repo.id, "{msg}");
        self.feedback.push(Feedback::warning(msg));
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!(repository = %self.repo.id, "{msg}");
        self.feedback.push(Feedback::error(msg));
    }
}
