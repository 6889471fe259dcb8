//! Jetstream WebSocket source.

use brewlog_core::TRACKED_COLLECTIONS;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use super::FrameSource;
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscribes to a Jetstream endpoint filtered to the tracked collections.
pub struct JetstreamSource {
    endpoint: Url,
    socket: Option<Socket>,
}

impl JetstreamSource {
    /// `endpoint` is the subscribe URL, e.g.
    /// `wss://jetstream2.us-east.bsky.network/subscribe`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid stream url '{endpoint}': {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "stream url must be ws:// or wss://, got '{endpoint}'"
            )));
        }
        Ok(Self {
            endpoint,
            socket: None,
        })
    }

    fn subscribe_url(&self, cursor: Option<u64>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for collection in TRACKED_COLLECTIONS {
                query.append_pair("wantedCollections", collection);
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }
}

impl FrameSource for JetstreamSource {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn connect(&mut self, cursor: Option<u64>) -> Result<()> {
        self.socket = None;
        let url = self.subscribe_url(cursor);
        debug!(%url, "opening websocket");
        let (socket, _) = connect_async(url.as_str()).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<String>> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::Stream("not connected".to_string()));
        };
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| Error::Stream(format!("non-utf8 binary frame: {e}")));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server sent close");
                    self.socket = None;
                    return Ok(None);
                }
                Some(Ok(other)) => trace!(?other, "ignoring control frame"),
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(e.into());
                }
                None => {
                    self.socket = None;
                    return Ok(None);
                }
            }
        }
    }
}
