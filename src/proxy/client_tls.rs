use std::{io::BufReader, path::Path, sync::Arc};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{
        pki_types::{CertificateDer, ServerName},
        ClientConfig, RootCertStore,
    },
    TlsConnector,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientTlsError {
    #[error("Failed to parse PEM section")]
    SectionParsingError,
    #[error("Expected a certificate")]
    ExpectedCertificate,
    #[error("Adding a certificate to the root store failed: {0}")]
    RootStorePopulationError(#[from] tokio_rustls::rustls::Error),
    #[error("{0:?} is not a valid TLS server name")]
    InvalidServerName(String),
    #[error("Failed during I/O: {0}")]
    IOError(#[from] std::io::Error),
}

fn expect_certificate(item: rustls_pemfile::Item) -> Result<CertificateDer<'static>, ClientTlsError> {
    match item {
        rustls_pemfile::Item::X509Certificate(cert) => Ok(cert),
        _ => Err(ClientTlsError::ExpectedCertificate),
    }
}

/// Trust anchors for the upstream's certificate: the operator-supplied CA
/// file when one is configured, the bundled webpki roots otherwise.
fn build_roots(cacert_file: Option<&Path>) -> Result<RootCertStore, ClientTlsError> {
    let mut roots = RootCertStore::empty();
    match cacert_file {
        Some(path) => {
            let mut ca_file = BufReader::new(std::fs::File::open(path)?);
            let certs: Vec<_> = rustls_pemfile::read_all(&mut ca_file)
                .map(|item| {
                    item.map_err(|_| ClientTlsError::SectionParsingError)
                        .and_then(expect_certificate)
                })
                .collect::<Result<Vec<_>, _>>()?;
            for cert in certs {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// TLS client handshake with the upstream proxy itself, before any proxy
/// protocol bytes cross the wire. The session targets the upstream's own
/// host, not the final destination.
pub async fn connect(
    stream: TcpStream,
    host: &str,
    cacert_file: Option<&Path>,
) -> Result<TlsStream<TcpStream>, ClientTlsError> {
    let config = ClientConfig::builder()
        .with_root_certificates(build_roots(cacert_file)?)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let domain = ServerName::try_from(host.to_owned())
        .map_err(|_| ClientTlsError::InvalidServerName(host.to_owned()))?;

    debug!("performing a TLS handshake with {host}...");
    Ok(connector.connect(domain, stream).await?)
}
