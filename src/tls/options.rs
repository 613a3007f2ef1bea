//! TLS settings carried by the client configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rustls::RootCertStore;
use rustls::client::danger::ServerCertVerifier;

use crate::core::ConfigError;

/// Length of a SHA-256 digest.
const PIN_DIGEST_LEN: usize = 32;

/// TLS protocol versions a session may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

impl TlsVersion {
    pub(crate) fn rustls_version(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "TLSv1.2" | "TLS1.2" | "1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" | "TLS1.3" | "1.3" => Ok(TlsVersion::Tls13),
            other => Err(ConfigError::UnsupportedTlsVersion(other.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("TLSv1.2"),
            TlsVersion::Tls13 => f.write_str("TLSv1.3"),
        }
    }
}

/// Where certificate trust comes from.
#[derive(Debug, Clone, Default)]
pub enum TrustAnchors {
    /// The operating system's certificate store.
    #[default]
    Platform,
    /// An explicit set of root certificates.
    Roots(Arc<RootCertStore>),
    /// A caller-supplied trust evaluator. Pinning still applies on top.
    Custom(Arc<dyn ServerCertVerifier>),
}

/// TLS options.
///
/// Disabled by default. With an empty pin list pinning is off; with an empty
/// version list both TLS 1.2 and 1.3 are allowed.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Wrap the connection in TLS.
    pub enabled: bool,
    /// Trust evaluator for the server chain.
    pub trust: TrustAnchors,
    /// Check the server certificate against the configured host after the
    /// handshake.
    pub verify_hostname: bool,
    /// Base64 SHA-256 digests of acceptable SubjectPublicKeyInfo structures.
    pub pinned_spki_sha256: Vec<String>,
    /// Acceptable protocol versions.
    pub versions: Vec<TlsVersion>,
}

impl TlsOptions {
    /// TLS disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// TLS enabled against the platform trust store, hostname verification on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            verify_hostname: true,
            ..Self::default()
        }
    }

    /// Set the trust evaluator.
    pub fn trust(mut self, trust: TrustAnchors) -> Self {
        self.trust = trust;
        self
    }

    /// Trust exactly these roots.
    pub fn roots(self, roots: RootCertStore) -> Self {
        self.trust(TrustAnchors::Roots(Arc::new(roots)))
    }

    /// Toggle post-handshake hostname verification.
    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }

    /// Replace the pin set.
    pub fn pins<I, S>(mut self, pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pinned_spki_sha256 = pins.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the negotiable protocol versions.
    pub fn versions(mut self, versions: impl IntoIterator<Item = TlsVersion>) -> Self {
        self.versions = versions.into_iter().collect();
        self
    }

    /// Whether pinning is active.
    pub fn pinning_enabled(&self) -> bool {
        !self.pinned_spki_sha256.is_empty()
    }

    /// Versions handed to rustls. Empty means both.
    pub(crate) fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        if self.versions.is_empty() {
            return vec![&rustls::version::TLS13, &rustls::version::TLS12];
        }
        let mut versions: Vec<&'static rustls::SupportedProtocolVersion> =
            Vec::with_capacity(self.versions.len());
        for version in &self.versions {
            let v = version.rustls_version();
            if !versions.iter().any(|known| std::ptr::eq(*known, v)) {
                versions.push(v);
            }
        }
        versions
    }

    /// Check that every pin is base64 of a SHA-256 digest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pin in &self.pinned_spki_sha256 {
            match STANDARD.decode(pin.trim()) {
                Ok(digest) if digest.len() == PIN_DIGEST_LEN => {}
                _ => return Err(ConfigError::InvalidPin(pin.clone())),
            }
        }
        Ok(())
    }
}
