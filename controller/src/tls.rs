//! TLS materials and the dual-protocol sniff.
//!
//! The controller accepts both plaintext and TLS clients on the same
//! listening socket, distinguished by peeking the first byte (`0x16` ⇒
//! ClientHello). This intentionally doesn't try to also recognise SSLv2 or
//! other plaintext-probe edge cases -- a ClientHello is the only signal
//! worth sniffing for.
//!
//! Uses `tokio_rustls` as the async TLS wrapper around a
//! `tokio::net::TcpStream`.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// The byte that opens a TLS record (a ClientHello handshake message).
pub const TLS_CLIENT_HELLO_BYTE: u8 = 0x16;

pub fn looks_like_tls(first_byte: u8) -> bool {
    first_byte == TLS_CLIENT_HELLO_BYTE
}

pub fn build_acceptor(cert_path: &str, key_path: &str, ca_path: Option<&str>) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = ServerConfig::builder();
    let config = if let Some(ca_path) = ca_path {
        let roots = load_root_store(ca_path)?;
        let verifier = tokio_rustls::rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()?;
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    Ok(rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))
}

fn load_root_store(path: &str) -> anyhow::Result<tokio_rustls::rustls::RootCertStore> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let mut store = tokio_rustls::rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        store.add(cert?)?;
    }
    Ok(store)
}

/// Pulls the peer's leaf certificate CN out of an established TLS session,
/// feeding the ACL's `cert.cn`/`issuer.cn` fields.
///
/// A from-scratch X.509 Subject/CN parser is a separate dependency
/// (`x509-parser`) this pass doesn't pull in for one field. Real CN
/// extraction is left as a follow-up; until then mTLS connections reach
/// the ACL with `cert_cn: None`, matching an unauthenticated peer.
pub fn peer_cert_cn(_certs: &[CertificateDer<'static>]) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_0x16_is_recognised_as_tls() {
        assert!(looks_like_tls(0x16));
        assert!(!looks_like_tls(b'G'));
        assert!(!looks_like_tls(0x00));
    }
}
