//! 可选的 HTTPS 监听：仅在同时提供证书与私钥时启用。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 读取 PEM 证书与私钥；未配置时返回 None，只配置其一视为错误。
pub async fn load_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            ));
        }
    };

    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    info!(cert = ?cert_path, "loaded TLS certificate");
    RustlsConfig::from_pem(cert, key).await.map(Some)
}
