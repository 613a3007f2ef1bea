//! Reusable client TLS context.

use std::io;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use super::options::{TlsOptions, TrustAnchors};
use super::verifier::{ChainVerifier, PinningVerifier};
use crate::core::TlsError;

/// TLS client configuration bound to one target host.
///
/// Built once per engine; every connect creates a fresh
/// [`ClientConnection`] from it.
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    verify_hostname: bool,
}

impl TlsContext {
    /// Build the context for `host` from `options`.
    ///
    /// The trust evaluator is always wrapped in a [`PinningVerifier`]; it is
    /// a pass-through when no pins are configured.
    pub fn build(options: &TlsOptions, host: &str) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let inner: Arc<dyn ServerCertVerifier> = match &options.trust {
            TrustAnchors::Platform => Arc::new(ChainVerifier::new(
                Arc::new(platform_roots()?),
                Arc::clone(&provider),
            )),
            TrustAnchors::Roots(roots) => {
                Arc::new(ChainVerifier::new(Arc::clone(roots), Arc::clone(&provider)))
            }
            TrustAnchors::Custom(verifier) => Arc::clone(verifier),
        };
        let verifier = Arc::new(PinningVerifier::new(
            inner,
            options.pinned_spki_sha256.iter().cloned(),
        ));

        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&options.protocol_versions())
            .map_err(|e| TlsError::Context(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;

        tracing::debug!(
            host,
            pinning = options.pinning_enabled(),
            verify_hostname = options.verify_hostname,
            "TLS context built"
        );

        Ok(Self {
            config: Arc::new(config),
            server_name,
            verify_hostname: options.verify_hostname,
        })
    }

    /// Underlying rustls configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Name sent via SNI and used for hostname verification.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Start a new client session.
    pub fn new_session(&self) -> Result<ClientConnection, TlsError> {
        ClientConnection::new(self.client_config(), self.server_name.clone())
            .map_err(|e| map_rustls_error(&e))
    }

    /// Post-handshake checks on an established session.
    pub fn verify_session(&self, session: &ClientConnection) -> Result<(), TlsError> {
        if !self.verify_hostname {
            return Ok(());
        }
        let chain = session
            .peer_certificates()
            .ok_or_else(|| TlsError::Unverified("server presented no certificate".into()))?;
        self.verify_hostname(chain)
    }

    /// Check the leaf certificate of `chain` against the configured host.
    pub fn verify_hostname(&self, chain: &[CertificateDer<'_>]) -> Result<(), TlsError> {
        let host = self.server_name.to_str().into_owned();
        let leaf = chain
            .first()
            .ok_or_else(|| TlsError::HostnameMismatch(host.clone()))?;
        let parsed = ParsedCertificate::try_from(leaf).map_err(|e| map_rustls_error(&e))?;
        rustls::client::verify_server_name(&parsed, &self.server_name)
            .map_err(|_| TlsError::HostnameMismatch(host))
    }
}

fn platform_roots() -> Result<RootCertStore, TlsError> {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        tracing::warn!(%error, "skipping unreadable platform certificate");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!(added, ignored, "loaded platform trust store");
    if roots.is_empty() {
        return Err(TlsError::Context("platform trust store is empty".into()));
    }
    Ok(roots)
}

/// Translate a rustls failure into the crate's TLS error.
pub fn map_rustls_error(err: &rustls::Error) -> TlsError {
    match err {
        rustls::Error::Other(other) => other
            .0
            .downcast_ref::<TlsError>()
            .cloned()
            .unwrap_or_else(|| TlsError::Protocol(err.to_string())),
        rustls::Error::InvalidCertificate(_) => TlsError::Unverified(err.to_string()),
        _ => TlsError::Protocol(err.to_string()),
    }
}

/// Recover a TLS failure wrapped in an I/O error by rustls stream adapters.
pub(crate) fn tls_error_from_io(err: &io::Error) -> Option<TlsError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(map_rustls_error)
}
