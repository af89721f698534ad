pub mod schema;
mod store;

pub use store::{RepositoryStore, RepositoryStoreOpener};
