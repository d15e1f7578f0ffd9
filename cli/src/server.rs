// Health and metrics HTTP endpoint
//
//   GET /health   -> {status, active_connections, packets_processed, packets_dropped, avg_latency_ms}
//   GET /metrics  -> full node status (counters, drops by reason, queue, pool)

use betanet_core::MixnetNode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::Filter;

pub fn routes(
    node: Arc<MixnetNode>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let node_filter = warp::any().map(move || node.clone());

    let health_route = warp::path!("health")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(handle_health);

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(node_filter)
        .and_then(handle_metrics);

    health_route.or(metrics_route)
}

/// Serve until the task is aborted.
pub fn start(addr: SocketAddr, node: Arc<MixnetNode>) -> tokio::task::JoinHandle<()> {
    tracing::info!("Health endpoint on http://{}/health", addr);
    tokio::spawn(async move {
        warp::serve(routes(node)).run(addr).await;
    })
}

async fn handle_health(node: Arc<MixnetNode>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&node.health()))
}

async fn handle_metrics(node: Arc<MixnetNode>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&node.status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use betanet_core::{NodeConfig, NodeKeys, Role};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn node() -> Arc<MixnetNode> {
        let mut config = NodeConfig::for_role(Role::Exit);
        config.bind_host = "127.0.0.1".parse().unwrap();
        config.port = 0;
        config.health_port = 0;
        config.workers = 1;
        Arc::new(MixnetNode::start(&NodeKeys::generate(), config).await.unwrap())
    }

    async fn free_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(addr).await {
                let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = String::new();
                stream.read_to_string(&mut response).await.unwrap();
                return response;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("health endpoint never came up");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let node = node().await;
        let addr = free_addr().await;
        let server = start(addr, node.clone());

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("\"status\":\"healthy\""));
        assert!(health.contains("\"packets_dropped\":0"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("\"queue_depth\""));
        assert!(metrics.contains("\"reuse_rate\""));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        server.abort();
        node.shutdown().await;
    }
}
