// A thin JSON-RPC WebSocket client for driving the gateway's `/websocket`
// surface in integration tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self::from_stream(ws_stream))
    }

    /// Wrap an already-handshaken stream, for callers that need to customize
    /// the upgrade request (extra headers) before connecting.
    pub fn from_stream(ws_stream: WsStream) -> Self {
        let (write, read) = ws_stream.split();
        Self { write, read }
    }

    pub async fn call(&mut self, id: i64, method: &str, params: Value) -> Result<Value, Box<dyn std::error::Error>> {
        let req = serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id});
        self.write.send(Message::Text(req.to_string().into())).await?;
        loop {
            let v = self.recv_json().await?;
            if v.get("id").and_then(Value::as_i64) == Some(id) {
                return Ok(v);
            }
            // otherwise it's an unrelated notification; keep waiting
        }
    }

    pub async fn recv_json(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
