//! TLS layer for TCP listeners
//!
//! Builds a rustls [`ServerConfig`] from the PEM material in the
//! configuration and wraps a plain TCP [`Listener`] so that every accepted
//! connection is encrypted.

use crate::binder::BindTarget;
use crate::config::Configuration;
use crate::connection::Listener;
use crate::error::{Error, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::io::BufReader;
use std::sync::Arc;
use tracing::info;

/// Produces TLS-wrapped listeners
#[derive(Debug, Clone)]
pub struct TlsServerFactory {
    config: Arc<ServerConfig>,
    version: String,
}

impl TlsServerFactory {
    /// Build the TLS context
    ///
    /// # Errors
    ///
    /// Configuration errors for a non-TCP bind, a missing or unreadable key
    /// or certificate, an unknown TLS version, or client verification
    /// without a CA bundle.
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let target = BindTarget::parse(&configuration.bind()?)?;
        if !target.is_tcp() {
            return Err(Error::config("TLS can only be used on TCP servers"));
        }

        let version = configuration
            .tls_version()?
            .ok_or_else(|| Error::config("You must configure a tls_version to enable TLS"))?;
        let key_pem = configuration
            .tls_key()?
            .ok_or_else(|| Error::config("You must configure a tls_key to enable TLS"))?;
        let cert_pem = configuration
            .tls_certificate()?
            .ok_or_else(|| Error::config("You must configure a tls_certificate to enable TLS"))?;

        let certs = parse_certificates(&cert_pem, "tls_certificate")?;
        let key = parse_private_key(&key_pem)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(protocol_versions(&version)?)?;

        let builder = if configuration.verify_client_tls_certificate() {
            let ca_pem = configuration.client_tls_certificate_ca()?.ok_or_else(|| {
                Error::config("You must configure a client_tls_certificate_ca to verify client certificates")
            })?;
            builder.with_client_cert_verifier(client_verifier(&ca_pem, provider)?)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder.with_single_cert(certs, key)?;

        Ok(Self {
            config: Arc::new(config),
            version,
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// Layer TLS over a TCP listener
    pub fn wrap_with_tls(&self, listener: Listener) -> Result<Listener> {
        match listener {
            Listener::Tcp(listener) => {
                info!(version = %self.version, "TLS enabled on listening socket");
                Ok(Listener::Tls {
                    listener,
                    config: self.server_config(),
                })
            }
            Listener::Tls { listener, .. } => Ok(Listener::Tls {
                listener,
                config: self.server_config(),
            }),
            Listener::Unix(_) => Err(Error::config("TLS can only be used on TCP servers")),
        }
    }
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// The configured version is pinned, not treated as a minimum
fn protocol_versions(version: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    match version {
        "TLSv1_2" => Ok(TLS12_ONLY),
        "TLSv1_3" => Ok(TLS13_ONLY),
        other => Err(Error::config(format!("Unsupported tls_version \"{other}\""))),
    }
}

fn parse_certificates(pem: &str, setting: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("Failed to parse {setting}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::config(format!("No certificates found in {setting}")));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_bytes()))
        .map_err(|e| Error::config(format!("Failed to parse tls_key: {e}")))?
        .ok_or_else(|| Error::config("No private key found in tls_key"))
}

fn client_verifier(
    ca_pem: &str,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem, "client_tls_certificate_ca")? {
        roots.add(cert)?;
    }
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| Error::config(format!("Invalid client_tls_certificate_ca: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::net::TcpListener;

    fn empty() -> Configuration {
        Configuration::with_environment(Vec::<(String, String)>::new())
    }

    fn self_signed() -> (String, String) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn tls_config(version: &str) -> Configuration {
        let (cert, key) = self_signed();
        empty()
            .with_bind("tcp://127.0.0.1:0")
            .with_tls_version(version)
            .with_tls_certificate(cert)
            .with_tls_key(key)
    }

    #[test]
    fn test_builds_for_each_version() {
        for version in ["TLSv1_2", "TLSv1_3"] {
            assert!(TlsServerFactory::new(&tls_config(version)).is_ok(), "{version}");
        }
    }

    #[test]
    fn test_rejects_unix_bind() {
        let config = tls_config("TLSv1_3").with_bind("unix:///tmp/tls.sock");
        assert!(TlsServerFactory::new(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_missing_key_or_certificate() {
        let (cert, key) = self_signed();
        let base = empty().with_bind("tcp://127.0.0.1:0").with_tls_version("TLSv1_3");

        let err = TlsServerFactory::new(&base.clone().with_tls_certificate(cert)).unwrap_err();
        assert!(err.to_string().contains("tls_key"));

        let err = TlsServerFactory::new(&base.with_tls_key(key)).unwrap_err();
        assert!(err.to_string().contains("tls_certificate"));
    }

    #[test]
    fn test_garbage_pem_is_configuration_error() {
        let config = tls_config("TLSv1_3").with_tls_certificate("not a certificate");
        assert!(TlsServerFactory::new(&config).unwrap_err().is_configuration());

        let config = tls_config("TLSv1_3").with_tls_key("not a key");
        assert!(TlsServerFactory::new(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_invalid_version() {
        let config = tls_config("TLSv1_3").with_tls_version("TLSv1_1");
        assert!(TlsServerFactory::new(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_client_verification_requires_ca() {
        let config = tls_config("TLSv1_3").with_verify_client_tls_certificate(true);
        let err = TlsServerFactory::new(&config).unwrap_err();
        assert!(err.to_string().contains("client_tls_certificate_ca"));

        let (ca, _) = self_signed();
        let config = config.with_client_tls_certificate_ca(ca);
        assert!(TlsServerFactory::new(&config).is_ok());
    }

    #[test]
    fn test_wrap_with_tls() {
        let factory = TlsServerFactory::new(&tls_config("TLSv1_3")).unwrap();

        let tcp = Listener::Tcp(TcpListener::bind("127.0.0.1:0").unwrap());
        assert!(factory.wrap_with_tls(tcp).unwrap().is_tls());

        let dir = tempfile::tempdir().unwrap();
        let unix = Listener::Unix(std::os::unix::net::UnixListener::bind(dir.path().join("s")).unwrap());
        assert!(factory.wrap_with_tls(unix).unwrap_err().is_configuration());
    }
}
