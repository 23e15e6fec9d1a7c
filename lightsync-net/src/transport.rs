//! gRPC channel construction over direct TCP or Tor streams.

use crate::{Error, Result, TorClient};
use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;
use tracing::{debug, warn};

trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

type BoxedStream = Box<dyn AsyncReadWrite + Send + Unpin>;
type ConnectorStream = TokioIo<BoxedStream>;

/// Split an endpoint URI into host and port, defaulting the port by scheme.
pub fn uri_host_port(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| Error::Network("Endpoint missing host".to_string()))?
        .to_string();
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    Ok((host, port))
}

/// Connect a channel over plain TCP. TLS, if configured on `endpoint`, is
/// layered on top by tonic.
pub async fn connect_direct_channel(endpoint: Endpoint) -> Result<Channel> {
    debug!("Creating direct gRPC channel to {}", endpoint.uri());
    let connector = service_fn(|uri: Uri| async move { connect_direct(uri).await });

    endpoint
        .connect_with_connector(connector)
        .await
        .map_err(|e| Error::Network(format!("gRPC connection failed: {}", e)))
}

/// Lazily connect a channel whose connections are opened through `tor`.
///
/// The first RPC on the channel triggers the Tor stream.
pub fn connect_tor_channel(tor: TorClient, endpoint: Endpoint) -> Channel {
    debug!("Creating Tor gRPC channel to {}", endpoint.uri());
    let connector = service_fn(move |uri: Uri| {
        let tor = tor.clone();
        async move { connect_via_tor(tor, uri).await }
    });

    endpoint.connect_with_connector_lazy(connector)
}

async fn connect_direct(uri: Uri) -> Result<ConnectorStream> {
    let (host, port) = uri_host_port(&uri)?;
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => {
            stream.set_nodelay(true)?;
            Ok(TokioIo::new(Box::new(stream)))
        }
        Err(e) => {
            warn!("Direct connection to {}:{} failed: {}", host, port, e);
            Err(Error::Connection(format!(
                "Direct connection to {}:{} failed: {}",
                host, port, e
            )))
        }
    }
}

async fn connect_via_tor(tor: TorClient, uri: Uri) -> Result<ConnectorStream> {
    let (host, port) = uri_host_port(&uri)?;
    let status = tor.status().await;
    debug!("Opening Tor stream to {}:{} (status={:?})", host, port, status);
    let stream = tor.connect_stream(&host, port).await?;
    Ok(TokioIo::new(Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_host_port_defaults() {
        let uri: Uri = "https://lightwalletd.example.com".parse().unwrap();
        assert_eq!(
            uri_host_port(&uri).unwrap(),
            ("lightwalletd.example.com".to_string(), 443)
        );

        let uri: Uri = "http://127.0.0.1:9067".parse().unwrap();
        assert_eq!(uri_host_port(&uri).unwrap(), ("127.0.0.1".to_string(), 9067));

        let uri: Uri = "http://10.0.0.1".parse().unwrap();
        assert_eq!(uri_host_port(&uri).unwrap().1, 80);
    }

    #[tokio::test]
    async fn test_direct_channel_refused() {
        let endpoint = Endpoint::from_static("http://127.0.0.1:9")
            .connect_timeout(std::time::Duration::from_secs(2));
        assert!(connect_direct_channel(endpoint).await.is_err());
    }
}
