use axum::extract::ws::Message;
use bytes::Bytes;

/// Transport-neutral websocket frame. The pump only ever sees these.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<Message> for WsFrame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsFrame::Text(text.as_str().to_owned()),
            Message::Binary(data) => WsFrame::Binary(data),
            Message::Ping(data) => WsFrame::Ping(data),
            Message::Pong(data) => WsFrame::Pong(data),
            Message::Close(_) => WsFrame::Close,
        }
    }
}

impl From<WsFrame> for Message {
    fn from(frame: WsFrame) -> Self {
        match frame {
            WsFrame::Text(text) => Message::Text(text.into()),
            WsFrame::Binary(data) => Message::Binary(data),
            WsFrame::Ping(data) => Message::Ping(data),
            WsFrame::Pong(data) => Message::Pong(data),
            WsFrame::Close => Message::Close(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("websocket transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    Closed,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("bad websocket json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("write timed out")]
    WriteTimeout,
    #[error("read deadline exceeded")]
    ReadTimeout,
}

impl From<axum::Error> for PumpError {
    fn from(e: axum::Error) -> Self {
        PumpError::Transport(e.to_string())
    }
}

impl PumpError {
    /// Normal ways for a connection to end; not worth a warning.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Closed | Self::ReadTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_map_to_axum_messages() {
        let msg: Message = WsFrame::Text("hi".into()).into();
        assert_eq!(WsFrame::from(msg), WsFrame::Text("hi".into()));

        let msg: Message = WsFrame::Close.into();
        assert!(matches!(msg, Message::Close(None)));
        assert_eq!(WsFrame::from(Message::Pong(Bytes::from_static(b"p"))), WsFrame::Pong(Bytes::from_static(b"p")));
    }
}
