//! TCP handshake probe

use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;
use tracing::debug;

use super::Prober;
use crate::constants::{ESTABLISHED, FAILED};
use crate::error::ProbeError;
use crate::model::{ProbeValue, TcpRecord};

impl Prober {
    /// Complete a TCP handshake with `addr` on the HTTP port.
    pub async fn tcp(&self, addr: IpAddr) -> TcpRecord {
        let endpoint = SocketAddr::new(addr, self.settings.tcp_port);
        let attempt = tokio::time::timeout(self.settings.tcp_timeout, TcpStream::connect(endpoint)).await;

        let outcome = match attempt {
            Ok(Ok(stream)) => stream.peer_addr().map_err(ProbeError::from),
            Ok(Err(err)) => Err(ProbeError::from(err)),
            Err(_) => Err(ProbeError::Timeout(self.settings.tcp_timeout)),
        };

        match outcome {
            Ok(peer) => TcpRecord {
                status: ProbeValue::text(ESTABLISHED),
                remote: ProbeValue::text(peer.ip().to_string()),
            },
            Err(err) => {
                debug!(%endpoint, %err, "TCP probe failed");
                TcpRecord { status: ProbeValue::text(FAILED), remote: ProbeValue::na() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{settings_for, spawn_dns, FakeAnswer};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_established_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dns = spawn_dns(|_| FakeAnswer::Silent).await;
        let mut settings = settings_for(dns);
        settings.tcp_port = port;
        let prober = Prober::new(settings).unwrap();

        let record = prober.tcp("127.0.0.1".parse().unwrap()).await;
        assert_eq!(record.status, ProbeValue::text(ESTABLISHED));
        assert_eq!(record.remote, ProbeValue::text("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_refused_is_failed() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let dns = spawn_dns(|_| FakeAnswer::Silent).await;
        let mut settings = settings_for(dns);
        settings.tcp_port = port;
        let prober = Prober::new(settings).unwrap();

        let record = prober.tcp("127.0.0.1".parse().unwrap()).await;
        assert_eq!(record.status, ProbeValue::text(FAILED));
        assert_eq!(record.remote, ProbeValue::na());
    }
}
