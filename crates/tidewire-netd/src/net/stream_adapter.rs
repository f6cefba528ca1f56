use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

/// Presents the binary messages of a WebSocket as one byte stream, so the
/// packet framer works the same over WebSocket and raw TCP.
///
/// Packets may span or share WebSocket messages. Text frames are ignored.
pub struct WebSocketStream<S> {
    inner: S,
    pending: Bytes,
}

impl<S> WebSocketStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WebSocketStream<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => this.pending = data,
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(_)))) => {
                    debug!("Ignoring text frame on binary WebSocket");
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn concatenates_binary_messages_and_skips_others() {
        let messages: Vec<Result<Message, tungstenite::Error>> = vec![
            Ok(Message::Binary(Bytes::from_static(b"ab"))),
            Ok(Message::Ping(Bytes::new())),
            Ok(Message::Text("hello".into())),
            Ok(Message::Binary(Bytes::from_static(b"cde"))),
            Ok(Message::Close(None)),
        ];
        let mut reader = WebSocketStream::new(stream::iter(messages));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn small_reads_split_a_message() {
        let messages: Vec<Result<Message, tungstenite::Error>> =
            vec![Ok(Message::Binary(Bytes::from_static(b"xyz")))];
        let mut reader = WebSocketStream::new(stream::iter(messages));

        let mut one = [0u8; 2];
        reader.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"xy");
        assert_eq!(reader.read_u8().await.unwrap(), b'z');
    }
}
