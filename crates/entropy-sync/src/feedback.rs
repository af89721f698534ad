use std::fmt;

/// User-facing notes collected while a repository syncs.
///
/// The library never prints; every [`RepositoryReport`](crate::RepositoryReport)
/// carries its notes and the binary renders them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Info(String),
    /// The sync carried on regardless.
    Warning(String),
    /// Signature or key trouble. Loud, but never blocks an update by itself.
    Security(String),
    Error(String),
}

impl Feedback {
    pub fn info(msg: impl Into<String>) -> Self {
        Self::Info(msg.into())
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self::Warning(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn is_info(&self) -> bool {
        self.prefix().is_none()
    }

    /// Security notes count as warnings.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning(_) | Self::Security(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn text(&self) -> &str {
        let (Self::Info(text) | Self::Warning(text) | Self::Security(text) | Self::Error(text)) =
            self;
        text
    }

    fn prefix(&self) -> Option<&'static str> {
        match self {
            Self::Info(_) => None,
            Self::Warning(_) => Some("warning"),
            Self::Security(_) => Some("security"),
            Self::Error(_) => Some("error"),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix() {
            Some(prefix) => write!(f, "{prefix}: {}", self.text()),
            None => f.write_str(self.text()),
        }
    }
}
