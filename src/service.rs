//! HTTP stats service: one JSON route exposing the engine's counters.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::poset::{Poset, PosetStats};

async fn stats(State(poset): State<Arc<Poset>>) -> Json<PosetStats> {
    Json(poset.stats())
}

/// Serve `GET /stats` until the shutdown token fires.
pub async fn serve(
    addr: SocketAddr,
    poset: Arc<Poset>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new().route("/stats", get(stats)).with_state(poset);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "stats service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;
    use crate::peers::{Peer, Peers};
    use crate::poset::InmemStore;

    #[tokio::test]
    async fn stats_route_reports_counters() {
        let kp = SigningKeypair::generate();
        let peers = Arc::new(Peers::new(vec![Peer::new(
            kp.public.clone(),
            "127.0.0.1:12000".into(),
        )]));
        let store = Arc::new(InmemStore::new(Arc::clone(&peers), 10));
        let poset = Arc::new(Poset::new(peers, store, None));

        let shutdown = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/stats", get(stats))
            .with_state(Arc::clone(&poset));
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        let body = reqwest_lite(bound).await;
        assert!(body.contains("last_block_index"));
        assert!(body.contains("-1"));
        server.abort();
    }

    /// Minimal HTTP GET without extra dependencies.
    async fn reqwest_lite(addr: SocketAddr) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }
}
