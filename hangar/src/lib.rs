//! Hangar: in-memory columnar table exchange over Arrow Flight
//!
//! A server keeps named Arrow tables in a catalog; clients put, get, describe,
//! list and drop them. Puts stream in batches and become visible only when
//! complete. Gets stream a committed table back in the order it was built.

pub mod buffer;
pub mod catalog;
pub mod client;
pub mod error;
pub mod flight;
pub mod flow;
pub mod key;

// Re-export main types
pub use buffer::{ChunkedTable, TableSnapshot, TableSummary};
pub use catalog::{Catalog, CatalogListing, CommitReceipt, StagingHandle};
pub use client::{ClientConfig, HangarClient, TableInfo};
pub use error::{HangarError, Result};
pub use flight::{start_server, HangarFlightService, PutCommit, ServerConfig, ServerHandle};
pub use flow::{GetFlow, GetState, PutFlow, PutState};
pub use key::{encode_key, parse_ticket, DescriptorKind, TableKey};
