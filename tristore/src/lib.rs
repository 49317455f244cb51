//! # tristore - a file-backed multi-index record store
//!
//! tristore keeps records in a paged file and maintains three persistent
//! indices over them:
//!
//! - an **extendible hash index** on the record key, for point lookups,
//! - a **region quadtree** on the record position, for rectangle queries,
//! - a **character trie** on the record name, for prefix queries.
//!
//! All of them live in fixed-size blocks of their own block file, next to a
//! small metadata file, so a store reopens without rebuilding anything. The
//! [`RecordCoordinator`] is the only entry point: it fans every mutation out
//! to the heap and the three indices and rolls all of them back together
//! when any step fails.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tristore::{BoundingBox, Point, Record, StoreBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StoreBuilder::new()
//!     .path("parcels")
//!     .region(BoundingBox::new(0.0, 0.0, 10.0, 10.0))
//!     .open_or_create()?;
//!
//! store.insert(Record::new(1, Point::new(2.0, 2.0), "ann"))?;
//! store.insert(Record::new(2, Point::new(8.0, 8.0), "bob").with_description("corner lot"))?;
//!
//! assert!(store.find_by_key(2)?.is_some());
//! assert_eq!(store.find_in_region(&BoundingBox::new(0.0, 0.0, 5.0, 5.0))?.len(), 1);
//! assert_eq!(store.find_by_prefix("b")?[0].name, "bob");
//!
//! store.delete(1)?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`storage`] - block files, metadata files and the record heap
//! - [`index`] - the hash index, the quadtree and the trie
//! - [`coordinator`] - the store itself, atomic mutations and integrity checks
//! - [`config`] / [`builder`] - layout and runtime configuration
//! - [`errors`] - the error type shared by every layer

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod geometry;
pub mod index;
pub mod record;
pub mod storage;

pub use builder::StoreBuilder;
pub use config::{StoreConfig, StoreLayout};
pub use coordinator::{FailPoint, IntegrityReport, RecordCoordinator, StoreStats, StoreStructure};
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use geometry::{BoundingBox, Point};
pub use index::HashFunction;
pub use record::{Record, RecordLocation};
