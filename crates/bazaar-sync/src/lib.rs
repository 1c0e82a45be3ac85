//! Peer-to-peer synchronization for the Bazaar marketplace.
//!
//! Devices exchange manifests of what changed since they last met, pull and
//! push the differences over a [`Transport`], and run every incoming record
//! through the deterministic rules in [`merge`]. Writes are broadcast to
//! local subscribers through [`ChangeNotifier`].

pub mod backup;
pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod store_handle;
pub mod telemetry;
pub mod transport;

pub use backup::ImportStats;
pub use config::SyncConfig;
pub use error::{MergeError, SyncError, SyncResult};
pub use events::{ChangeEvent, ChangeNotifier, ChangeOrigin};
pub use merge::{merge, MergeContext, MergeOutcome};
pub use orchestrator::{CycleReport, SessionHandle, SyncEngine};
pub use rate_limit::{PeerRateLimiter, TokenBucket};
pub use retry::RetryConfig;
pub use session::{Session, SessionState};
pub use store_handle::{ApplyReport, StoreHandle};
pub use telemetry::init_tracing;
pub use transport::{ChannelTransport, StreamTransport, Transport};
