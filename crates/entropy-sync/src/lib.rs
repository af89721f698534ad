pub mod artifact;
pub mod bulk;
pub mod checksum;
pub mod compression;
pub mod context;
pub mod differential;
pub mod download;
pub mod error;
pub mod feedback;
pub mod fetch;
pub mod hooks;
pub mod lock;
pub mod mirror;
pub mod negotiator;
pub mod orchestrator;
pub mod payload;
pub mod repository;
pub mod service;
pub mod settings;
pub mod signature;
pub mod store;
pub mod tier;

pub use error::SyncError;
pub use feedback::Feedback;
pub use fetch::{AbortSignal, FetchOutcome, FetchRequest, FetchStats, Fetcher};
pub use hooks::{CacheInvalidator, DirectoryCache, SelfUpdateProbe, StoreSelfUpdateProbe};
pub use mirror::{FailureSeverity, MirrorScores};
pub use orchestrator::{
    EXIT_ALL_UNAVAILABLE, EXIT_BUSY, EXIT_HARD_FAILURE, EXIT_OK, EXIT_PARTIAL, RepositoryOutcome,
    RepositoryReport, SyncOrchestrator, SyncOutcome,
};
pub use payload::{CompressionFormat, PayloadKind};
pub use repository::{RepositoryDescriptor, RepositoryId, ServiceEndpoint};
pub use service::{
    RepositoryQuery, ServiceConnection, ServiceConnector, ServiceError, SessionToken,
};
pub use settings::{SyncLimits, SyncSettings, Timeouts};
pub use signature::{SignatureError, SignatureVerifier, Verification};
pub use store::{
    Annotation, ChecksumOptions, MetadataStore, PackageId, PackageRecord, PackageSets, StoreError,
    StoreOpener, TreeUpdates,
};
pub use tier::ProtocolTier;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
