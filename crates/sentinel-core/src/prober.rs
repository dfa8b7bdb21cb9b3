//! C6 — the active prober: TCP connect, optional TLS handshake, optional
//! HTTP GET, against a single target; plus the concurrency-bounded
//! round-robin scan over a whole list.
//!
//! Probe failures never propagate as errors (§7): every branch below
//! converts a socket/TLS/parse failure into the matching passive-style
//! report (`report_timeout`, `report_tcp_failure`, `report_http_status`)
//! and swallows the `Result` the report call returns, same as the engine
//! would for any sync-lagged target.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::CheckType;
use crate::engine::Engine;
use crate::target::Target;

/// Unifies the plain-TCP and TLS-wrapped byte streams so the HTTP probe
/// logic downstream doesn't need to know which one it got.
trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

async fn report_probe_outcome(
    engine: &Engine,
    target: &Target,
    outcome: Result<Option<u16>, ProbeFailure>,
) {
    let hostname = target.hostname.as_deref();
    match outcome {
        Ok(Some(status)) => {
            let _ = engine.report_http_status(&target.ip, target.port, hostname, Some(status)).await;
        }
        Ok(None) => {
            let _ = engine.report_success(&target.ip, target.port, hostname).await;
        }
        Err(ProbeFailure::Timeout) => {
            let _ = engine.report_timeout(&target.ip, target.port, hostname).await;
        }
        Err(ProbeFailure::Tcp) => {
            let _ = engine.report_tcp_failure(&target.ip, target.port, hostname).await;
        }
        Err(ProbeFailure::BadStatusLine) => {
            // §9 open question: an unparseable status line is folded into
            // `report_http_status(None)`, which coerces to code 0 and is
            // therefore indistinguishable from a literal zero status.
            let _ = engine.report_http_status(&target.ip, target.port, hostname, None).await;
        }
    }
}

enum ProbeFailure {
    Timeout,
    Tcp,
    BadStatusLine,
}

/// Probes one target per its engine's `active` config and feeds the
/// result back through the matching passive-style report call.
///
/// `Ok(None)` is returned for a bare `tcp` profile success (no status to
/// report, `report_success` was already called).
async fn probe_one(engine: &Engine, target: &Target) -> Result<Option<u16>, ProbeFailure> {
    let active = &engine.config().checks.active;
    let addr = (target.ip.as_str(), target.port);

    let tcp = match tokio::time::timeout(active.timeout(), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(ip = %target.ip, port = target.port, error = %e, "probe connect failed");
            return Err(ProbeFailure::Tcp);
        }
        Err(_) => return Err(ProbeFailure::Timeout),
    };

    if active.r#type == CheckType::Tcp {
        return Ok(None);
    }

    let mut stream: Box<dyn ProbeStream> = if active.r#type == CheckType::Https {
        match handshake_tls(engine.config(), target, tcp).await {
            Ok(tls) => Box::new(tls),
            Err(()) => return Err(ProbeFailure::Tcp),
        }
    } else {
        Box::new(tcp)
    };

    let request = build_request(active, target);
    match tokio::time::timeout(active.timeout(), stream.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err(ProbeFailure::Tcp),
        Err(_) => return Err(ProbeFailure::Timeout),
    }

    let mut buf = vec![0u8; 512];
    let n = match tokio::time::timeout(active.timeout(), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => return Err(ProbeFailure::Tcp),
        Ok(Err(_)) => return Err(ProbeFailure::Tcp),
        Err(_) => return Err(ProbeFailure::Timeout),
    };

    match parse_status_line(&buf[..n]) {
        Some(status) => Ok(Some(status)),
        None => Err(ProbeFailure::BadStatusLine),
    }
}

async fn handshake_tls(
    config: &crate::config::Config,
    target: &Target,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ()> {
    let active = &config.checks.active;

    let builder = tokio_rustls::rustls::ClientConfig::builder();
    let builder_with_verifier = if active.https_verify_certificate {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification))
    };

    let tls_config = match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert_pem), Some(key_pem)) => {
            let (chain, key) = load_client_identity(cert_pem, key_pem)?;
            builder_with_verifier.with_client_auth_cert(chain, key).map_err(|e| {
                warn!(error = %e, "invalid client certificate/key configured");
            })?
        }
        _ => builder_with_verifier.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(tls_config));

    let sni_name = active
        .https_sni
        .clone()
        .or_else(|| target.hostheader.clone())
        .or_else(|| target.hostname.clone())
        .unwrap_or_else(|| target.ip.clone());

    let server_name = ServerName::try_from(sni_name).map_err(|_| ())?;

    connector.connect(server_name, tcp).await.map_err(|e| {
        warn!(ip = %target.ip, port = target.port, error = %e, "tls handshake failed");
    })
}

fn load_client_identity(
    cert_pem: &str,
    key_pem: &str,
) -> Result<
    (
        Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>,
        tokio_rustls::rustls::pki_types::PrivateKeyDer<'static>,
    ),
    (),
> {
    let mut cert_reader = std::io::Cursor::new(cert_pem.as_bytes());
    let chain: Vec<_> = rustls_pemfile::certs(&mut cert_reader).filter_map(|r| r.ok()).collect();

    let mut key_reader = std::io::Cursor::new(key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .ok()
        .flatten()
        .ok_or(())?;

    if chain.is_empty() {
        return Err(());
    }
    Ok((chain, key))
}

/// Used only when `checks.active.https_verify_certificate = false`: skips
/// chain validation entirely so self-signed probe targets can be checked.
#[derive(Debug)]
struct NoCertVerification;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

fn build_request(active: &crate::config::ActiveConfig, target: &Target) -> String {
    let host = target
        .hostheader
        .clone()
        .or_else(|| target.hostname.clone())
        .unwrap_or_else(|| target.ip.clone());

    let mut req = format!("GET {} HTTP/1.1\r\nConnection: close\r\n", active.http_path);
    for header in &active.req_headers {
        req.push_str(header);
        req.push_str("\r\n");
    }
    req.push_str(&format!("Host: {host}\r\n\r\n"));
    req
}

fn parse_status_line(bytes: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(bytes).ok()?;
    let line = text.lines().next()?;
    let mut parts = line.splitn(3, ' ');
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse::<u16>().ok()
}

/// Round-robin partitions `targets` into `active.concurrency` packages,
/// spawns `concurrency - 1` of them concurrently, and runs the last one
/// on the calling task so it absorbs its own share of the scan's time
/// (§4.6). Checks `worker_exiting` between items within a package.
pub async fn active_check_targets(engine: &Arc<Engine>, targets: Vec<Target>) {
    let concurrency = engine.config().checks.active.concurrency.max(1);
    let mut packages: Vec<Vec<Target>> = vec![Vec::new(); concurrency];
    for (i, target) in targets.into_iter().enumerate() {
        packages[i % concurrency].push(target);
    }

    let mut last = packages.pop().unwrap_or_default();
    let mut handles = Vec::with_capacity(packages.len());

    for package in packages {
        let engine = Arc::clone(engine);
        handles.push(tokio::spawn(async move {
            probe_package(&engine, package).await;
        }));
    }

    probe_package(engine, std::mem::take(&mut last)).await;

    for handle in handles {
        let _ = handle.await;
    }
}

async fn probe_package(engine: &Arc<Engine>, package: Vec<Target>) {
    for target in package {
        if engine.worker_exiting.load(Ordering::SeqCst) {
            break;
        }
        let outcome = probe_one(engine, &target).await;
        report_probe_outcome(engine, &target, outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found\r\n"), Some(404));
    }

    #[test]
    fn rejects_a_malformed_status_line() {
        assert_eq!(parse_status_line(b"garbage"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 notanumber\r\n"), None);
    }

    #[test]
    fn request_includes_path_headers_and_host() {
        let mut active = crate::config::ActiveConfig::default();
        active.http_path = "/healthz".into();
        active.req_headers = vec!["X-Probe: sentinel".into()];
        let target = Target::new("10.0.0.1", 80, Some("api.example".into()), None);
        let req = build_request(&active, &target);
        assert!(req.starts_with("GET /healthz HTTP/1.1\r\n"));
        assert!(req.contains("X-Probe: sentinel\r\n"));
        assert!(req.contains("Host: api.example\r\n"));
    }
}
