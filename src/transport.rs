use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, SinkExt, StreamExt};
use std::{collections::VecDeque, time::Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    core::truncate_message,
    protocol::EventStreamDecoder,
    settings::{build_stream_url, normalize_base_url, Settings, TransportKind},
    Error, Result,
};

/// Opens push connections. One call yields one exclusively owned transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>>;
}

/// A live, receive-only push connection.
#[async_trait]
pub trait Transport: Send {
    /// Next complete text payload. `None` means the peer closed the stream.
    async fn next_frame(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

pub fn connector_from_settings(settings: &Settings) -> Result<Box<dyn Connector>> {
    let base_url = normalize_base_url(&settings.base_url)?;
    let url = build_stream_url(&base_url, &settings.stream_path, settings.transport)?;
    let token = settings.token().map(str::to_string);
    let connector: Box<dyn Connector> = match settings.transport {
        TransportKind::Sse => Box::new(SseConnector::new(
            url,
            token,
            Duration::from_secs(settings.connect_timeout_secs.max(1)),
        )?),
        TransportKind::Websocket => Box::new(WebSocketConnector::new(url, token)),
    };
    Ok(connector)
}

pub struct SseConnector {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SseConnector {
    pub fn new(url: String, token: Option<String>, connect_timeout: Duration) -> Result<Self> {
        // no overall timeout: the response body is the long-lived stream
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        log::debug!("sse connect {}", self.url);
        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| Error::Transport(format!("Stream connection failed: {error}")))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response body>".to_string());
            return Err(Error::Http {
                context: "stream connection",
                status,
                body: truncate_message(&body, 200),
            });
        }

        Ok(Box::new(SseTransport {
            body: response.bytes_stream().boxed(),
            decoder: EventStreamDecoder::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseTransport {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: EventStreamDecoder,
    pending: VecDeque<String>,
}

#[async_trait]
impl Transport for SseTransport {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.push(&chunk)),
                Some(Err(error)) => {
                    return Some(Err(Error::Transport(format!("Stream read error: {error}"))))
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.body = futures_util::stream::empty().boxed();
    }
}

pub struct WebSocketConnector {
    url: String,
    token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self { url, token }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        log::debug!("ws connect {}", self.url);
        let mut ws_request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| Error::Transport(format!("Failed to build websocket request: {error}")))?;
        if let Some(token) = self.token.as_deref() {
            let header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|error| {
                Error::Config(format!("Invalid token for websocket header: {error}"))
            })?;
            ws_request.headers_mut().insert("Authorization", header);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .map_err(|error| Error::Transport(format!("Stream connection failed: {error}")))?;
        Ok(Box::new(WebSocketTransport { ws_stream }))
    }
}

struct WebSocketTransport {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    log::trace!("ws text frame bytes={}", text.len());
                    return Some(Ok(text.as_str().to_string()));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(error) = self.ws_stream.send(Message::Pong(payload)).await {
                        return Some(Err(Error::Transport(format!(
                            "Failed to send pong: {error}"
                        ))));
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return Some(Err(Error::Transport("Stream closed by server".to_string())))
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    return Some(Err(Error::Transport(format!("Stream read error: {error}"))))
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}
