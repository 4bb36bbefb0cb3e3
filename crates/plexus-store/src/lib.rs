//! # Plexus Store
//!
//! Durable plugin metadata behind the [`MetadataRepository`] trait.
//!
//! ## Backends
//!
//! - **InMemory**: process lifetime only, used by tests and ephemeral hosts
//! - **JsonFile**: a single pretty-printed JSON document, rewritten on every
//!   mutation
//!
//! ## Example
//!
//! ```rust
//! use plexus_store::{InMemoryRepository, MetadataRepository, PluginRecord};
//!
//! #[tokio::main]
//! async fn main() -> plexus_store::Result<()> {
//!     let repo = InMemoryRepository::new();
//!     repo.upsert(PluginRecord::new("p1", "Sample", "1.0.0", "plugins/libsample.so"))
//!         .await?;
//!
//!     let found = repo.find_by_id("p1").await?;
//!     assert!(found.is_some());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod error;
mod inmemory;
mod json_file;
mod record;
mod repository;

pub use error::{Result, StoreError};
pub use inmemory::InMemoryRepository;
pub use json_file::JsonFileRepository;
pub use record::PluginRecord;
pub use repository::MetadataRepository;
