//! Upstream dialing: address rotation, the dial-hard loop, the default
//! dialer and TLS wrapping.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;

use crate::error::Error;

use super::host::HostClient;
use super::pool::Stream;

/// How long a dial attempt may take when neither read nor write timeouts are
/// configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Round-robin cursor over the lazily split address list.
pub(crate) struct Rotator {
    pub(crate) addrs: Vec<String>,
    idx: u32,
}

impl Rotator {
    pub(crate) fn new() -> Rotator {
        Rotator {
            addrs: Vec::new(),
            idx: 0,
        }
    }
}

impl HostClient {
    /// Returns the next upstream address, splitting the configured
    /// comma-separated list on first use.
    fn next_addr(&self) -> String {
        let mut rot = self.inner.addrs.lock().unwrap();
        if rot.addrs.is_empty() {
            rot.addrs = self
                .inner
                .config
                .addr
                .split(',')
                .map(str::to_owned)
                .collect();
        }
        if rot.addrs.len() > 1 {
            let i = rot.idx as usize % rot.addrs.len();
            rot.idx = rot.idx.wrapping_add(1);
            rot.addrs[i].clone()
        } else {
            rot.addrs[0].clone()
        }
    }

    /// Attempts every address in the rotator once before giving up, bounded
    /// by a total deadline of `read_timeout + write_timeout` (or
    /// [`DEFAULT_DIAL_TIMEOUT`] when both are zero).
    ///
    /// The deadline is only re-checked after a failed attempt, so slowly
    /// failing dials can end the loop before every address was tried.
    pub(crate) async fn dial_host_hard(&self) -> crate::Result<Stream> {
        let mut n = self.inner.addrs.lock().unwrap().addrs.len();
        if n == 0 {
            // The rotator is not populated until the first next_addr call.
            n = 1;
        }

        let mut timeout = self.inner.config.read_timeout + self.inner.config.write_timeout;
        if timeout.is_zero() {
            timeout = DEFAULT_DIAL_TIMEOUT;
        }
        let deadline = Instant::now() + timeout;

        let mut last_err = None;
        while n > 0 {
            match self.dial_host().await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    tracing::debug!(error = %err, "dial attempt failed");
                    last_err = Some(err);
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            n -= 1;
        }
        Err(last_err.unwrap_or_else(|| {
            Error::new_dial(io::Error::other("no addresses to dial"))
        }))
    }

    async fn dial_host(&self) -> crate::Result<Stream> {
        let config = &self.inner.config;
        let mut addr = self.next_addr();

        let tcp = match &config.dial {
            Some(dial) => dial(addr.clone()).await.map_err(Error::new_dial)?,
            None => {
                addr = add_missing_port(addr, config.is_tls);
                default_dial(&addr, config.dial_dual_stack)
                    .await
                    .map_err(Error::new_dial)?
            }
        };
        tracing::trace!(addr = %addr, "connected");

        if !config.is_tls {
            return Ok(Stream::Plain(tcp));
        }

        let tls_config = config
            .tls_config
            .clone()
            .unwrap_or_else(default_tls_config);
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&addr);
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| Error::new_dial(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let tls = TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .map_err(Error::new_dial)?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}

/// The default dialer: resolves `addr` and connects to the first reachable
/// address, IPv4-only unless `dual_stack` is set. Each attempt is bounded by
/// [`DEFAULT_DIAL_TIMEOUT`].
async fn default_dial(addr: &str, dual_stack: bool) -> io::Result<TcpStream> {
    let connect = async move {
        let mut last_err = None;
        for sock_addr in lookup_host(addr).await? {
            if !dual_stack && !sock_addr.is_ipv4() {
                continue;
            }
            match TcpStream::connect(sock_addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no suitable address found for {addr}"),
            )
        }))
    };
    match tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, connect).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
    }
}

/// Appends the scheme-default port when `addr` has none.
pub(crate) fn add_missing_port(addr: String, is_tls: bool) -> String {
    if addr.contains(':') {
        return addr;
    }
    let port = if is_tls { 443 } else { 80 };
    format!("{addr}:{port}")
}

/// The config used when the caller supplies none: certificate verification
/// is skipped and rustls' built-in in-memory session cache handles
/// resumption.
fn default_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            )
        })
        .clone()
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
