//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use std::io;
use std::net::IpAddr;
use tokio::fs;
use tracing::{info, warn};

/// 构建 Rustls 配置：加载指定的 PEM 证书，未指定时在内存中生成自签名证书。
pub async fn build_rustls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    let (cert, key) = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!(cert = cert_path, "loading TLS certificate");
            (fs::read(cert_path).await?, fs::read(key_path).await?)
        }
        (None, None) => self_signed_pem(host)?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
    };
    RustlsConfig::from_pem(cert, key).await
}

/// 生成自签名证书与私钥（PEM）。
fn self_signed_pem(host: IpAddr) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names.clone()).map_err(|err| io::Error::other(err.to_string()))?;
    warn!(?names, "using a generated self-signed TLS certificate");
    Ok((
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn self_signed_pair_is_pem() {
        let (cert, key) =
            self_signed_pem(IpAddr::V4(Ipv4Addr::LOCALHOST)).expect("generate certificate");
        assert!(String::from_utf8_lossy(&cert).starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(String::from_utf8_lossy(&key).contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn half_configured_pair_is_rejected() {
        let result =
            build_rustls_config(Some("cert.pem"), None, IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        assert_eq!(
            result.err().map(|err| err.kind()),
            Some(io::ErrorKind::InvalidInput)
        );
    }
}
