//! Control HTTP server
//!
//! Answers ACME HTTP-01 challenges, exposes Prometheus metrics and a health
//! endpoint. The proxy routes `/.well-known/acme-challenge/` here.

use crate::acme::{ChallengeStore, CHALLENGE_PATH_PREFIX};
use crate::apis::metrics::gather_controller_metrics;
use crate::error::BoxError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct ControlServer {
    challenges: Arc<ChallengeStore>,
}

impl ControlServer {
    pub fn new(challenges: Arc<ChallengeStore>) -> Self {
        Self { challenges }
    }

    /// Bind `bind_addr` and serve until the task is dropped
    pub async fn serve(self, bind_addr: &str) -> Result<(), BoxError> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("Control server listening on {}", bind_addr);
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };
            debug!("Accepted control connection from {}", peer_addr);

            let challenges = self.challenges.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let challenges = challenges.clone();
                    async move {
                        Ok::<_, Infallible>(
                            handle_request(req.method(), req.uri().path(), &challenges).await,
                        )
                    }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Route a request to the challenge, metrics or health handler
pub async fn handle_request(
    method: &Method,
    path: &str,
    challenges: &ChallengeStore,
) -> Response<Full<Bytes>> {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    if let Some(token) = path.strip_prefix(CHALLENGE_PATH_PREFIX) {
        return match challenges.get_challenge(token).await {
            Some(key_auth) => {
                info!(token = %token, "Serving HTTP-01 challenge");
                text_response(StatusCode::OK, key_auth)
            }
            None => {
                debug!(token = %token, "Unknown HTTP-01 token");
                text_response(StatusCode::NOT_FOUND, "challenge not found")
            }
        };
    }

    match path {
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/metrics" => match gather_controller_metrics() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("{}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Should collect body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("Should be UTF-8")
    }

    #[tokio::test]
    async fn test_challenge_responses() {
        let store = ChallengeStore::new();
        store.add_challenge("tok1", "tok1.thumbprint").await;

        let found = handle_request(&Method::GET, "/.well-known/acme-challenge/tok1", &store).await;
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(body_text(found).await, "tok1.thumbprint");

        let missing =
            handle_request(&Method::GET, "/.well-known/acme-challenge/nope", &store).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_metrics_and_errors() {
        let store = ChallengeStore::new();

        let health = handle_request(&Method::GET, "/healthz", &store).await;
        assert_eq!(health.status(), StatusCode::OK);

        crate::apis::metrics::set_tracked_links(1);
        let metrics = handle_request(&Method::GET, "/metrics", &store).await;
        assert_eq!(metrics.status(), StatusCode::OK);
        assert!(body_text(metrics).await.contains("gatehouse_tracked_links"));

        let post = handle_request(&Method::POST, "/healthz", &store).await;
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);

        let unknown = handle_request(&Method::GET, "/", &store).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let store = Arc::new(ChallengeStore::new());
        store.add_challenge("tcp-token", "tcp-token.key").await;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Should bind ephemeral port");
        let addr = listener.local_addr().expect("Should have local address");
        let server = tokio::spawn(ControlServer::new(store).serve_listener(listener));

        let mut stream = tokio::net::TcpStream::connect(addr)
            .await
            .expect("Should connect");
        stream
            .write_all(
                b"GET /.well-known/acme-challenge/tcp-token HTTP/1.1\r\n\
                  Host: localhost\r\nConnection: close\r\n\r\n",
            )
            .await
            .expect("Should send request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("Should read response");

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("tcp-token.key"));
        server.abort();
    }
}
