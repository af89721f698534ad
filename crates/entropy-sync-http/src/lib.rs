pub mod fetcher;
pub mod service;

pub use fetcher::{FetchError, HttpFetcher};
pub use service::HttpServiceConnector;

const USER_AGENT: &str = concat!("entropy-sync/", env!("CARGO_PKG_VERSION"));
