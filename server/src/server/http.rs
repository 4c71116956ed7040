//! Admin HTTP server for health checks and metrics

use crate::audit;
use crate::buffer::AggregationBuffer;
use crate::metrics;
use crate::storage::{with_timeout, TimeseriesSink};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AdminState {
    pub buffer: Arc<AggregationBuffer>,
    pub sink: Arc<dyn TimeseriesSink>,
}

/// Start the admin HTTP server serving /healthz, /readyz, and /metrics.
pub async fn serve_admin(
    addr: SocketAddr,
    state: AdminState,
    cancel: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { handle(req, &state).await }
            }))
        }
    });

    tracing::info!("Admin HTTP server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res
}

async fn handle(req: Request<Body>, state: &AdminState) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let response = match path.as_str() {
        "/healthz" => text(StatusCode::OK, "ok\n".into()),

        "/readyz" => match with_timeout(READINESS_TIMEOUT, state.sink.check()).await {
            Ok(()) => text(
                StatusCode::OK,
                format!(
                    "ready\nbuffered_tags {}\nbuffered_samples {}\n",
                    state.buffer.tag_count(),
                    state.buffer.sample_count()
                ),
            ),
            Err(e) => text(StatusCode::SERVICE_UNAVAILABLE, format!("not ready: {}\n", e)),
        },

        "/metrics" => {
            let mut res = text(StatusCode::OK, metrics::encode_metrics());
            res.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            res
        }

        _ => text(StatusCode::NOT_FOUND, "not found\n".into()),
    };

    if matches!(path.as_str(), "/metrics" | "/readyz" | "/healthz") {
        audit::admin_http_request(&path, response.status().as_u16());
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::Utc;

    fn state() -> AdminState {
        AdminState {
            buffer: Arc::new(AggregationBuffer::new()),
            sink: Arc::new(MemoryStore::new()),
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_of(res: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_readyz_reports_buffer() {
        let state = state();
        state.buffer.append("t1", Utc::now(), 1.0);
        let res = handle(get("/readyz"), &state).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(body_of(res).await.contains("buffered_samples 1"));
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_path() {
        let state = state();
        let res = handle(get("/metrics"), &state).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = handle(get("/nope"), &state).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
