//! WebSocket transport over `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use cvesync_core::Credential;

use super::{OpenError, Transport, TransportLink, TransportSignal};

/// Opens WebSocket links with a bearer `Authorization` header.
#[derive(Clone, Debug)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// Transport for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    /// Endpoint this transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink, OpenError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| OpenError::new(format!("transport error: {e}")))?;
        let header = HeaderValue::from_str(&credential.bearer_header())
            .map_err(|_| OpenError::new("unauthorized: credential is not a valid header value"))?;
        let _ = request.headers_mut().insert(AUTHORIZATION, header);

        let connected =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| OpenError::new("transport error: connect timed out"))?;
        let (stream, _response) = connected.map_err(|e| OpenError::new(open_failure_reason(&e)))?;
        info!(url = %self.url, "websocket connected");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportSignal>();

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed, closing write loop");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportSignal::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break close_reason(frame.as_ref()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read failed");
                        break format!("transport error: {e}");
                    }
                    None => break "transport close".to_string(),
                }
            };
            let _ = in_tx.send(TransportSignal::Closed(reason));
        });

        Ok(TransportLink::new(out_tx, in_rx).with_tasks([writer.abort_handle(), reader.abort_handle()]))
    }
}

/// Reason string for a failed handshake.
fn open_failure_reason(error: &WsError) -> String {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                format!("unauthorized (HTTP {status})")
            } else {
                format!("transport error: HTTP {status}")
            }
        }
        WsError::Io(e) => format!("transport error: {e}"),
        other => format!("transport error: {other}"),
    }
}

/// Reason string for a close frame.
fn close_reason(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => frame.reason.to_string(),
        _ => "io server disconnect".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cvesync_core::protocol::DisconnectReason;
    use tokio_tungstenite::tungstenite::http::Response;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn http_error(status: u16) -> WsError {
        let response = Response::builder().status(status).body(None).unwrap();
        WsError::Http(response)
    }

    #[test]
    fn http_401_is_unauthorized() {
        let reason = open_failure_reason(&http_error(401));
        assert_eq!(reason, "unauthorized (HTTP 401)");
        assert!(matches!(
            DisconnectReason::classify(&reason, true),
            DisconnectReason::Unauthorized(_)
        ));
    }

    #[test]
    fn http_502_is_transport_error() {
        let reason = open_failure_reason(&http_error(502));
        assert!(matches!(
            DisconnectReason::classify(&reason, true),
            DisconnectReason::TransportError(_)
        ));
    }

    #[test]
    fn close_frame_reason_is_used() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "ping timeout".into(),
        };
        assert_eq!(close_reason(Some(&frame)), "ping timeout");
        assert_eq!(close_reason(None), "io server disconnect");
    }

    #[tokio::test]
    async fn refused_connection_reports_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = WsTransport::new("ws://127.0.0.1:9/ws", Duration::from_secs(2));
        let err = transport.open(&Credential::from("t")).await.unwrap_err();
        assert!(err.reason.starts_with("transport error"), "{}", err.reason);
    }

    #[tokio::test]
    async fn invalid_url_reports_transport_error() {
        let transport = WsTransport::new("not a url", Duration::from_secs(1));
        let err = transport.open(&Credential::from("t")).await.unwrap_err();
        assert!(err.reason.starts_with("transport error"));
    }
}
