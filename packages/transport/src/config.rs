//! Immutable per-server configuration shared by all channels to one server
//!
//! The TLS trust context is expensive to build (certificate files, the
//! platform store) and is therefore computed once per configuration and
//! cached, including the failed-to-build case so the error is logged once.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::error;

use crate::tls::TlsContext;

/// Which TLS protocol versions a server may negotiate.
///
/// Anything older than TLS 1.2 is not offered at all; rustls does not
/// implement the legacy protocol versions.
#[derive(Clone, Copy, Debug)]
pub struct TlsVersions {
    pub tls12: bool,
    pub tls13: bool,
}

impl Default for TlsVersions {
    fn default() -> Self {
        TlsVersions {
            tls12: true,
            tls13: true,
        }
    }
}

/// Connection parameters for one configured server.
///
/// Shared read-only between every [`Channel`](crate::Channel) talking to
/// that server; the channel never mutates it.
#[derive(Debug)]
pub struct ServerConfig {
    /// Hostname to resolve and to verify certificates against. May be empty
    /// for pure tunnel configurations.
    pub host: String,
    pub port: u16,
    /// Shell command spoken to over a socketpair instead of a TCP socket.
    pub tunnel: Option<String>,
    pub tls_versions: TlsVersions,
    /// Extra trusted certificates; these are also pinned, i.e. an exact
    /// peer-certificate match passes verification unconditionally.
    pub cert_file: Option<PathBuf>,
    /// Whether to also trust the platform's default certificate store.
    pub system_certs: bool,
    tls_context: OnceCell<Option<Arc<TlsContext>>>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            tunnel: None,
            tls_versions: TlsVersions::default(),
            cert_file: None,
            system_certs: true,
            tls_context: OnceCell::new(),
        }
    }

    pub fn with_tunnel(command: impl Into<String>) -> Self {
        let mut conf = ServerConfig::new("", 0);
        conf.tunnel = Some(command.into());
        conf
    }

    /// The cached TLS trust context for this server, built on first use.
    /// A context that failed to build stays invalid; the cause is logged
    /// once at build time.
    pub(crate) fn tls_context(&self) -> Option<Arc<TlsContext>> {
        self.tls_context
            .get_or_init(|| match TlsContext::build(self) {
                Ok(ctx) => Some(Arc::new(ctx)),
                Err(err) => {
                    error!("{err}");
                    None
                }
            })
            .clone()
    }
}
