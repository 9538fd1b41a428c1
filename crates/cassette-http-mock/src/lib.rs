//! Cassette: HTTP traffic capture-and-replay toolkit.
//!
//! Two sides, coupled only through the on-disk record format:
//!
//! - The **recording reverse proxy** (`cassette-record-proxy`) forwards
//!   requests to a configured upstream, captures the full exchange (including
//!   streaming `text/event-stream` bodies with per-event timestamps) and
//!   persists each one as a JSON record.
//! - The **mock server** (`cassette-mock`) loads those records into an
//!   in-memory index at startup and replays them against matching requests,
//!   optionally reproducing the recorded timing with configurable jitter, and
//!   optionally routing through declarative scenario definitions instead of
//!   header-based lookup.

pub mod proxy;
pub mod record;
pub mod scenario;
pub mod server;
pub mod store;
