//! TLS layer.
//!
//! [`TlsContext`] turns [`TlsOptions`] into a shared rustls client
//! configuration. Certificate trust is evaluated by the configured
//! [`TrustAnchors`] and then, when pins are set, by [`PinningVerifier`].
//! Hostname verification is a separate post-handshake step.
//!
//! ```text
//! handshake ──> trust evaluator ──> SPKI pins ──> Finished ──> hostname check
//!                 (chain only)      (if any)                   (if requested)
//! ```

mod context;
mod options;
mod verifier;

pub use context::{TlsContext, map_rustls_error};
pub(crate) use context::tls_error_from_io;
pub use options::{TlsOptions, TlsVersion, TrustAnchors};
pub use verifier::{ChainVerifier, PinningVerifier, spki_pin, spki_pins};
