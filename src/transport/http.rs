use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

use super::{Transport, TopicRouter};
use crate::cluster::NodeId;
use crate::config::TransportConfig;
use crate::error::{Result, SwarmError};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Messages as `POST http://{node}/{topic}`.
#[derive(Debug)]
pub struct HttpTransport {
    config: TransportConfig,
    client: reqwest::Client,
    router: Arc<TopicRouter>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SwarmError::transport(format!("Failed to build HTTP client: {}", e)))?;
        let router = Arc::new(TopicRouter::new(config.max_processing_time()));
        Ok(Self {
            config,
            client,
            router,
            local_addr: Mutex::new(None),
        })
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// `host:port` to dial for `node`. Ids carrying a port are used as-is.
    fn authority(&self, node: &NodeId) -> String {
        let id = node.as_str();
        if id.parse::<SocketAddr>().is_ok() {
            return id.to_string();
        }
        if let Ok(ip) = id.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.config.port).to_string();
        }
        match id.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
                id.to_string()
            }
            _ => format!("{}:{}", id, self.config.port),
        }
    }

    fn app(&self) -> Router {
        Router::new()
            .route("/", any(handle))
            .route("/{*topic}", any(handle))
            .with_state(self.router.clone())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn decode_body(headers: &HeaderMap, body: &Bytes) -> Result<Value> {
    if is_json(headers) {
        return serde_json::from_slice(body)
            .map_err(|e| SwarmError::bad_request(format!("Unable to decode request body: {}", e)));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn respond(result: Result<Option<Value>>) -> Response {
    match result {
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Ok(Some(Value::String(text))) => ([(header::CONTENT_TYPE, TEXT_PLAIN)], text).into_response(),
        Ok(Some(value)) => Json(value).into_response(),
        Err(e) => {
            warn!("Message handling failed: {}", e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, e.to_string()).into_response()
        }
    }
}

async fn handle(
    State(router): State<Arc<TopicRouter>>,
    ConnectInfo(from): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match decode_body(&headers, &body) {
        Ok(payload) => payload,
        Err(e) => return respond(Err(e)),
    };
    respond(
        router
            .dispatch(uri.path(), payload, Some(from.ip().to_string()))
            .await,
    )
}

#[async_trait]
impl Transport for HttpTransport {
    fn router(&self) -> Arc<TopicRouter> {
        self.router.clone()
    }

    async fn send(&self, node: &NodeId, topic: &str, payload: Value) -> Result<Option<Value>> {
        let url = format!("http://{}/{}", self.authority(node), topic.trim_start_matches('/'));
        let request = self.client.post(&url);
        let request = match payload {
            Value::String(text) => request.header(header::CONTENT_TYPE, TEXT_PLAIN).body(text),
            other => request.json(&other),
        };

        let response = request
            .send()
            .await
            .map_err(|e| SwarmError::transport(format!("{} unreachable: {}", node, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SwarmError::Remote {
                node: node.clone(),
                status: status.as_u16(),
                message,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let json = is_json(response.headers());
        let body = response.bytes().await?;
        if json {
            Ok(Some(serde_json::from_slice(&body)?))
        } else {
            Ok(Some(Value::String(String::from_utf8_lossy(&body).into_owned())))
        }
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SwarmError::transport(format!("Failed to bind {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        let app = self.app();
        info!(addr = %local, "Message server listening");
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!("Message server error: {}", e);
            }
            info!("Message server stopped");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use crate::transport::Message;

    fn transport() -> HttpTransport {
        HttpTransport::new(TransportConfig::default()).unwrap()
    }

    #[test]
    fn test_authority() {
        let t = transport();
        assert_eq!(t.authority(&NodeId::from("10.0.0.1")), "10.0.0.1:45892");
        assert_eq!(t.authority(&NodeId::from("10.0.0.1:9000")), "10.0.0.1:9000");
        assert_eq!(t.authority(&NodeId::from("worker-1")), "worker-1:45892");
        assert_eq!(t.authority(&NodeId::from("worker-1:81")), "worker-1:81");
        assert_eq!(t.authority(&NodeId::from("::1")), "[::1]:45892");
    }

    fn request(path: &str, content_type: &str, body: &'static str) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        request
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let t = transport();
        t.router().on("echo", |m: Message| async move { Ok(Some(m.payload)) });
        let response = t
            .app()
            .oneshot(request("/echo", "application/json", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_no_content() {
        let t = transport();
        let response = t
            .app()
            .oneshot(request("/nobody/home", "text/plain", "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_text_result_is_plain() {
        let t = transport();
        t.router().on("echo", |m: Message| async move { Ok(Some(m.payload)) });
        let response = t
            .app()
            .oneshot(request("/echo", "text/plain", "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
