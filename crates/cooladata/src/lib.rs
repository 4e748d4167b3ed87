//! CoolaData event tracker for Rust.
//!
//! Events are buffered in a bounded in-memory queue, grouped into batches
//! and delivered in the background with retry and backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! use cooladata::{Setup, Tracker};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cooladata::Error> {
//!     let tracker = Tracker::builder()
//!         .publish_interval(Duration::from_secs(10))
//!         .build()?;
//!     tracker.setup(Setup::new("api_token")).await?;
//!
//!     tracker.track("session_start")
//!         .property("build", "1.4.2")
//!         .send()
//!         .await?;
//!
//!     tracker.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod attribution;
mod batch;
mod builders;
mod client;
mod clock;
mod config;
mod error;
mod queue;
mod scheduler;
mod storage;
mod transport;
pub mod types;

pub use attribution::{
    AttributionSource, NoAttribution, StaticAttribution, UTM_CAMPAIGN_KEY, UTM_CONTENT_KEY,
    UTM_MEDIUM_KEY, UTM_SOURCE_KEY, UTM_TERM_KEY,
};
pub use batch::{Batch, BatchQueue};
pub use client::{SendableTrack, Tracker};
pub use config::{Config, Setup, TrackerBuilder};
pub use error::{Error, TransportError};
pub use queue::EventQueue;
pub use scheduler::SetupState;
pub use storage::{KeyValueStore, MemoryStore, USER_ID_KEY};
pub use transport::{HttpTransport, Transport};
pub use types::{DeliveryCallback, DeliveryResult, EventRecord, OperationEvent};
