//! Transport building blocks shared by the engines and the client.
//!
//! - [`Backoff`]: capped exponential backoff with jitter for connect retries
//! - [`RequestPacer`]: minimum spacing between requests
//! - [`SocketOptions`]: kernel socket tuning applied through `socket2`
//! - [`ConnectionState`], [`StateInfo`], [`TrafficEvent`]: lifecycle reporting
//! - [`Response`]: a decoded response frame with timing
//! - [`Metrics`]: running byte and RTT counters

mod backoff;
mod metrics;
mod pacing;
mod response;
mod socket;
mod state;

pub use backoff::Backoff;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pacing::{PacerAction, RequestPacer};
pub use response::Response;
pub use socket::SocketOptions;
pub use state::{ConnectionState, Direction, StateInfo, TrafficEvent};
