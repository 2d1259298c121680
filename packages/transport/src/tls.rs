//! TLS session management: context cache, handshake driving, trust decision
//!
//! The rustls-level certificate verifier is deliberately permissive; trust is
//! decided explicitly once the handshake completes, in this order: an exact
//! match against a pinned certificate passes unconditionally, otherwise the
//! chain must verify against the configured roots and the certificate must
//! name the configured host (subject-alternative DNS names first, common
//! name as fallback, with left-most single-label wildcards).

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::{Arc, Once};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::Socket;
use tracing::warn;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::ServerConfig;
use crate::error::TransportError;

static INIT: Once = Once::new();

/// Process-wide one-time TLS library initialization. Idempotent; invoked
/// lazily before the first handshake.
pub(crate) fn init() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Cached per-server trust context, built once per [`ServerConfig`].
#[derive(Debug)]
pub(crate) struct TlsContext {
    client: Arc<rustls::ClientConfig>,
    roots: Arc<RootCertStore>,
    /// Certificates from the configured certificate file; an exact peer
    /// match against one of these passes verification unconditionally.
    pinned: Vec<CertificateDer<'static>>,
    algs: WebPkiSupportedAlgorithms,
}

impl TlsContext {
    pub(crate) fn build(conf: &ServerConfig) -> Result<TlsContext, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algs = provider.signature_verification_algorithms;

        let mut versions: Vec<&'static rustls::SupportedProtocolVersion> = Vec::new();
        if conf.tls_versions.tls12 {
            versions.push(&rustls::version::TLS12);
        }
        if conf.tls_versions.tls13 {
            versions.push(&rustls::version::TLS13);
        }

        let mut roots = RootCertStore::empty();
        let mut pinned = Vec::new();
        if let Some(path) = &conf.cert_file {
            let file = File::open(path).map_err(|e| TransportError::CertificateFile {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
            let mut reader = BufReader::new(file);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<io::Result<_>>()
                .map_err(|e| TransportError::CertificateFile {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                })?;
            if certs.is_empty() {
                return Err(TransportError::CertificateFile {
                    path: path.display().to_string(),
                    detail: "no certificates found".to_string(),
                });
            }
            roots.add_parsable_certificates(certs.iter().cloned());
            pinned = certs;
        }
        if conf.system_certs {
            let loaded = rustls_native_certs::load_native_certs();
            if let Some(err) = loaded.errors.first() {
                warn!("Warning: Unable to load default certificate files: {err}");
            }
            roots.add_parsable_certificates(loaded.certs);
        }
        let roots = Arc::new(roots);

        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(|e| TransportError::TlsContext {
                host: conf.host.clone(),
                detail: e.to_string(),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredVerifier { algs }))
            .with_no_client_auth();

        Ok(TlsContext {
            client: Arc::new(client),
            roots,
            pinned,
            algs,
        })
    }
}

/// Accepts any certificate during the handshake; the explicit trust decision
/// happens afterwards in [`TlsSession::verify_peer`]. Handshake signatures
/// are still checked for real.
#[derive(Debug)]
struct DeferredVerifier {
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Progress of a non-blocking TLS operation: either it finished, or it needs
/// the descriptor to become readable/writable first.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Flow {
    Done,
    WantRead,
    WantWrite,
}

/// Why a TLS operation failed, with a human-readable cause.
#[derive(Debug)]
pub(crate) enum TlsFailure {
    Io(io::Error),
    Proto(rustls::Error),
    Eof,
}

impl fmt::Display for TlsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsFailure::Io(e) => e.fmt(f),
            TlsFailure::Proto(e) => e.fmt(f),
            TlsFailure::Eof => f.write_str("unexpected EOF"),
        }
    }
}

/// Result of a secure read: bytes delivered plus whether the session wants
/// the descriptor writable (e.g. for a pending key update).
pub(crate) struct TlsRead {
    pub(crate) n: usize,
    pub(crate) want_write: bool,
}

/// One TLS session bound to a connected descriptor.
pub(crate) struct TlsSession {
    conn: ClientConnection,
    ctx: Arc<TlsContext>,
    /// Decrypted bytes rustls holds that the channel has not consumed yet.
    buffered: usize,
}

impl TlsSession {
    pub(crate) fn new(ctx: Arc<TlsContext>, host: &str) -> Result<TlsSession, String> {
        let sni = if host.is_empty() {
            // No hostname configured (tunnel); an IP-form name suppresses SNI.
            ServerName::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED).into())
        } else {
            ServerName::try_from(host.to_string()).map_err(|e| e.to_string())?
        };
        let conn = ClientConnection::new(ctx.client.clone(), sni).map_err(|e| e.to_string())?;
        Ok(TlsSession {
            conn,
            ctx,
            buffered: 0,
        })
    }

    /// Pushes pending ciphertext out to the socket. Returns whether any
    /// remains, i.e. whether the session still wants write-readiness.
    pub(crate) fn flush(&mut self, sock: &Socket) -> Result<bool, TlsFailure> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut &*sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(TlsFailure::Io(e)),
            }
        }
        Ok(false)
    }

    /// Advances the handshake as far as the socket allows without blocking.
    pub(crate) fn handshake(&mut self, sock: &Socket) -> Result<Flow, TlsFailure> {
        loop {
            if self.flush(sock)? {
                return Ok(Flow::WantWrite);
            }
            if !self.conn.is_handshaking() {
                return Ok(Flow::Done);
            }
            match self.conn.read_tls(&mut &*sock) {
                Ok(0) => return Err(TlsFailure::Eof),
                Ok(_) => {
                    let state = self.conn.process_new_packets().map_err(TlsFailure::Proto)?;
                    self.buffered = state.plaintext_bytes_to_read();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::WantRead),
                Err(e) => return Err(TlsFailure::Io(e)),
            }
        }
    }

    /// Decrypts into `out`; `n == 0` means no plaintext was available yet.
    pub(crate) fn read(&mut self, sock: &Socket, out: &mut [u8]) -> Result<TlsRead, TlsFailure> {
        match self.conn.read_tls(&mut &*sock) {
            Ok(0) => {
                if self.buffered == 0 {
                    return Err(TlsFailure::Eof);
                }
                // Peer closed, but decrypted bytes remain deliverable.
            }
            Ok(_) => {
                let state = self.conn.process_new_packets().map_err(TlsFailure::Proto)?;
                self.buffered = state.plaintext_bytes_to_read();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(TlsFailure::Io(e)),
        }
        let n = match self.conn.reader().read(out) {
            Ok(0) => return Err(TlsFailure::Eof),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(TlsFailure::Io(e)),
        };
        self.buffered = self.buffered.saturating_sub(n);
        Ok(TlsRead {
            n,
            want_write: self.conn.wants_write(),
        })
    }

    /// Encrypts as much of `buf` as the session and socket accept without
    /// blocking, interleaving plaintext submission with ciphertext flushes
    /// so rustls's bounded plaintext buffer never overflows. Returns the
    /// accepted byte count and the want-write flag; a short count means the
    /// caller must retry the remainder after write-readiness.
    pub(crate) fn write(&mut self, sock: &Socket, buf: &[u8]) -> Result<(usize, bool), TlsFailure> {
        let mut accepted = 0;
        loop {
            if self.flush(sock)? {
                return Ok((accepted, true));
            }
            if accepted == buf.len() {
                return Ok((accepted, false));
            }
            match self.conn.writer().write(&buf[accepted..]) {
                // No room even though the ciphertext is drained; retry on
                // the next write-readiness.
                Ok(0) => return Ok((accepted, true)),
                Ok(n) => accepted += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((accepted, true)),
                Err(e) => return Err(TlsFailure::Io(e)),
            }
        }
    }

    /// Whether rustls still holds decrypted bytes the channel has not
    /// consumed; such bytes require an injected readiness to be redelivered.
    pub(crate) fn has_buffered_plaintext(&self) -> bool {
        self.buffered > 0
    }

    /// The explicit post-handshake trust decision (see module docs).
    /// `name` is the channel's display name, used in diagnostics only.
    pub(crate) fn verify_peer(&self, host: &str, name: &str) -> Result<(), String> {
        let chain = self.conn.peer_certificates().unwrap_or_default();
        let Some(end_entity) = chain.first() else {
            return Err("Error, no server certificate".to_string());
        };

        if self.ctx.pinned.iter().any(|pin| pin == end_entity) {
            return Ok(());
        }

        let parsed = ParsedCertificate::try_from(end_entity)
            .map_err(|e| format!("SSL error connecting {name}: {e}"))?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.ctx.roots,
            &chain[1..],
            UnixTime::now(),
            self.ctx.algs.all,
        )
        .map_err(|e| format!("SSL error connecting {name}: {e}"))?;

        if host.is_empty() {
            return Err(format!(
                "SSL error connecting {name}: Neither host nor matching certificate specified"
            ));
        }
        verify_hostname(end_entity.as_ref(), host)
    }
}

/// Checks the certificate's subject-alternative DNS names, then its common
/// name, against the configured hostname.
fn verify_hostname(cert_der: &[u8], hostname: &str) -> Result<(), String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| format!("Error, cannot parse server certificate: {e}"))?;

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(pattern) = general_name {
                if host_matches(hostname, pattern) {
                    return Ok(());
                }
            }
        }
    }

    if let Some(attr) = cert.subject().iter_common_name().next() {
        if let Ok(cn) = attr.as_str() {
            if host_matches(hostname, cn) {
                return Ok(());
            }
        }
    }

    Err(format!(
        "Error, certificate owner does not match hostname {hostname}"
    ))
}

/// Case-insensitive hostname match. A pattern of the form `*.<rest>` matches
/// `<one-label>.<rest>`; a bare `*` or a multi-level wildcard does not match
/// anything, and the wildcard never matches the parent domain itself.
fn host_matches(host: &str, pattern: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((_, tail)) => !tail.is_empty() && !rest.is_empty() && tail.eq_ignore_ascii_case(rest),
            None => false,
        };
    }
    !host.is_empty() && !pattern.is_empty() && host.eq_ignore_ascii_case(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn self_signed(sans: &[&str], common_name: Option<&str>) -> rcgen::Certificate {
        let mut params =
            CertificateParams::new(sans.iter().map(|s| (*s).to_string()).collect::<Vec<_>>())
                .expect("certificate params");
        let mut dn = DistinguishedName::new();
        if let Some(cn) = common_name {
            dn.push(DnType::CommonName, cn);
        }
        params.distinguished_name = dn;
        let key = KeyPair::generate().expect("key pair");
        params.self_signed(&key).expect("self-signed certificate")
    }

    #[test]
    fn wildcard_requires_exactly_one_sub_label() {
        assert!(host_matches("mail.example.com", "*.example.com"));
        assert!(!host_matches("example.com", "*.example.com"));
        assert!(!host_matches("a.b.example.com", "*.example.com"));
        assert!(!host_matches("mail", "*.example.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(host_matches("mail.example.com", "mail.example.com"));
        assert!(host_matches("MAIL.example.com", "mail.EXAMPLE.com"));
        assert!(!host_matches("imap.example.com", "mail.example.com"));
        assert!(!host_matches("", "mail.example.com"));
        assert!(!host_matches("mail.example.com", ""));
    }

    #[test]
    fn bare_star_matches_nothing() {
        assert!(!host_matches("mail.example.com", "*"));
        assert!(!host_matches("mail", "*"));
    }

    #[test]
    fn san_match_wins_even_with_mismatched_cn() {
        let cert = self_signed(&["mail.example.com"], Some("other.invalid"));
        assert!(verify_hostname(cert.der().as_ref(), "mail.example.com").is_ok());
    }

    #[test]
    fn common_name_is_a_fallback_without_sans() {
        let cert = self_signed(&[], Some("mail.example.com"));
        assert!(verify_hostname(cert.der().as_ref(), "mail.example.com").is_ok());
    }

    #[test]
    fn neither_san_nor_cn_matching_fails() {
        let cert = self_signed(&["imap.example.net"], Some("smtp.example.net"));
        let err = verify_hostname(cert.der().as_ref(), "mail.example.com").unwrap_err();
        assert!(err.contains("mail.example.com"));
    }

    #[test]
    fn wildcard_san_verifies_sub_label_host() {
        let cert = self_signed(&["*.example.com"], None);
        assert!(verify_hostname(cert.der().as_ref(), "mail.example.com").is_ok());
        assert!(verify_hostname(cert.der().as_ref(), "example.com").is_err());
    }

    #[test]
    fn pinned_certificates_load_from_file() {
        let cert = self_signed(&["mail.example.com"], None);
        let path = std::env::temp_dir().join(format!(
            "msync-transport-pin-{}.pem",
            std::process::id()
        ));
        std::fs::write(&path, cert.pem()).expect("write pem");

        let mut conf = crate::config::ServerConfig::new("mail.example.com", 993);
        conf.cert_file = Some(path.clone());
        conf.system_certs = false;
        let ctx = TlsContext::build(&conf).expect("context builds");
        assert_eq!(ctx.pinned.len(), 1);
        assert_eq!(ctx.pinned[0].as_ref(), cert.der().as_ref());

        let _ = std::fs::remove_file(path);
    }
}
