//! # isosocket
//!
//! Framed request/response TCP client for ISO-8583 style switch links.
//!
//! A client holds one connection to one host and exchanges one request frame
//! for one response frame at a time. It provides:
//!
//! - **Framing**: 2/4-byte length headers, fixed-size records, delimited
//!   records and TPDU-prefixed messages
//! - **Two engines**: blocking sockets on tokio's blocking pool, or tokio
//!   readiness with an explicit TLS handshake loop
//! - **TLS**: rustls with platform or custom trust, hostname verification
//!   and SHA-256 SPKI pinning
//! - **Resilience**: single-flight connect, retry with jittered exponential
//!   backoff, auto-reconnect after transport failures
//! - **Flow control**: bounded request queue, in-flight permits and minimum
//!   spacing between requests
//! - **Events**: lifecycle, traffic, error and retry notifications delivered
//!   on an inline or dedicated thread executor
//!
//! ## Modules
//!
//! - [`core`]: constants and error types
//! - [`framing`]: wire framers
//! - [`transport`]: socket options, backoff, pacing, lifecycle states
//! - [`tls`]: TLS options, trust evaluation and pinning
//! - [`engine`]: the two connection engines
//! - [`events`]: event types and dispatch
//! - [`client`]: configuration and the [`TcpClient`] facade
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use isosocket::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::builder("switch.example.com", 7000)
//!     .mode(EngineMode::NonBlocking)
//!     .framer(LengthPrefixedFramer::new(LengthWidth::Two, ByteOrder::BigEndian, false))
//!     .tls(TlsOptions::enabled().pins(["r/mIkG3eEpVdm+u/ko/cwxzOMo1bk4TyHIlByibiA5E="]))
//!     .request_timeout(Duration::from_secs(5))
//!     .listener(|event: &Event| println!("{event:?}"))
//!     .build()?;
//!
//! let client = TcpClient::new(config)?;
//! client.connect().await?;
//! let response = client.send_and_receive(b"0800...").await?;
//! println!("{} bytes in {:?}", response.payload().len(), response.rtt());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod engine;
pub mod events;
pub mod framing;
pub mod tls;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{
        ClientConfig, ClientConfigBuilder, EngineMode, Limits, RetryPolicy, TcpClient, Timeouts,
    };
    pub use crate::core::{ClientError, ClientResult, ConnectErrorKind};
    pub use crate::events::{ErrorStage, Event, EventListener, InlineDispatch, ThreadDispatch};
    pub use crate::framing::{
        ByteOrder, DelimiterFramer, FixedFramer, Framer, LengthPrefixedFramer, LengthWidth,
        TpduFramer,
    };
    pub use crate::tls::{TlsOptions, TlsVersion, TrustAnchors};
    pub use crate::transport::{ConnectionState, Response, SocketOptions};
}

// Re-export commonly used items at crate root
pub use crate::client::{ClientConfig, TcpClient};
pub use crate::core::{ClientError, ClientResult};
pub use crate::events::Event;
pub use crate::transport::Response;
