use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::{DecodeError, Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::{BufMut, BytesMut};
use futures_util::Stream;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use worker::{EventStream, WebSocket, WebsocketEvent};

/// Decode early data carried in `Sec-WebSocket-Protocol` (base64, either
/// alphabet, padding optional).
pub fn decode_early_data(header: Option<&str>) -> std::result::Result<Option<Vec<u8>>, DecodeError> {
    match header.map(str::trim) {
        Some(data) if !data.is_empty() => {
            let data = data.replace('+', "-").replace('/', "_").replace('=', "");
            URL_SAFE_NO_PAD.decode(data).map(Some)
        }
        _ => Ok(None),
    }
}

/// Byte-stream view of a server-side WebSocket. Every message, binary or
/// text, is read as raw bytes; every write is sent as one binary message.
#[pin_project]
pub struct WebSocketStream<'a> {
    ws: &'a WebSocket,
    #[pin]
    events: EventStream<'a>,
    buffer: BytesMut,
    closed: bool,
}

impl<'a> WebSocketStream<'a> {
    pub fn new(ws: &'a WebSocket, events: EventStream<'a>, early_data: Option<Vec<u8>>) -> Self {
        let mut buffer = BytesMut::with_capacity(4096);
        if let Some(data) = early_data {
            buffer.put_slice(&data);
        }
        Self {
            ws,
            events,
            buffer,
            closed: false,
        }
    }
}

impl AsyncRead for WebSocketStream<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let mut this = self.project();
        loop {
            if !this.buffer.is_empty() {
                let amt = std::cmp::min(this.buffer.len(), buf.remaining());
                buf.put_slice(&this.buffer.split_to(amt));
                return Poll::Ready(Ok(()));
            }

            if *this.closed {
                return Poll::Ready(Ok(()));
            }

            match this.events.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(WebsocketEvent::Message(msg)))) => {
                    if let Some(data) = msg.bytes() {
                        this.buffer.put_slice(&data);
                    } else if let Some(text) = msg.text() {
                        this.buffer.put_slice(text.as_bytes());
                    }
                }
                Poll::Ready(Some(Ok(WebsocketEvent::Close(_)))) | Poll::Ready(None) => {
                    *this.closed = true;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(Error::new(ErrorKind::Other, e.to_string())));
                }
            }
        }
    }
}

impl AsyncWrite for WebSocketStream<'_> {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let this = self.project();
        if *this.closed {
            return Poll::Ready(Err(Error::new(
                ErrorKind::BrokenPipe,
                "socket already closed",
            )));
        }
        if let Err(e) = this.ws.send_with_bytes(buf) {
            return Poll::Ready(Err(Error::new(ErrorKind::Other, e.to_string())));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
        if self.closed {
            return Poll::Ready(Err(Error::new(
                ErrorKind::BrokenPipe,
                "socket already closed",
            )));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.project();
        if !*this.closed {
            if let Err(e) = this.ws.close(Some(1000), Some("normal close")) {
                return Poll::Ready(Err(Error::new(ErrorKind::Other, e.to_string())));
            }
            *this.closed = true;
        }
        Poll::Ready(Ok(()))
    }
}
