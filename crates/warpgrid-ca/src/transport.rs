//! Minimal HTTP/1.1 JSON client used to talk to controllers.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::debug;

/// Transport-level failures, before any HTTP status was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed exchange: {0}")]
    Protocol(String),
}

/// Status and body of a completed exchange.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    /// Decode an `{"error": "..."}` body, falling back to the raw text.
    pub fn error_message(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: String,
        }
        match serde_json::from_slice::<ErrorBody>(&self.body) {
            Ok(body) => body.error,
            Err(_) => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

/// POST a JSON body to `http://{address}{path}`.
///
/// The whole exchange (connect, request, body) is bounded by `timeout`.
pub async fn post_json(
    address: &str,
    path: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<HttpResponse, TransportError> {
    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "controller connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(HOST, address)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, "warpgrid-node/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?
            .to_bytes();

        Ok(HttpResponse { status, body })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%address, %path, "controller request timed out");
            Err(TransportError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = post_json(&addr, "/", Vec::new(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _accept = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = post_json(&addr, "/", Vec::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn error_message_prefers_json_field() {
        let resp = HttpResponse {
            status: StatusCode::UNAUTHORIZED,
            body: Bytes::from_static(br#"{"error":"invalid join token"}"#),
        };
        assert_eq!(resp.error_message(), "invalid join token");

        let raw = HttpResponse {
            status: StatusCode::BAD_GATEWAY,
            body: Bytes::from_static(b"upstream down"),
        };
        assert_eq!(raw.error_message(), "upstream down");
    }
}
