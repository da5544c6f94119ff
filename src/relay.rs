//! Per-connection tunnel lifecycle.
//!
//! A session moves `Accepted -> Resolving -> Dialing -> Relaying -> Closed`,
//! or to `Failed` from any non-terminal state. Relaying is a byte-exact copy
//! in both directions; it ends as soon as either side reaches EOF or errors,
//! and the downstream socket is shut down before the session reports back.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;

use futures_util::future::{Either, select};
use futures_util::pin_mut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use worker::Socket;

use crate::error::TunnelError;
use crate::resolver::Target;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SERVER_ERROR: u16 = 1011;
/// Close reasons are limited to 123 bytes of UTF-8.
const MAX_CLOSE_REASON: usize = 123;
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Resolving,
    Dialing,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Accepted, Resolving) | (Resolving, Dialing) | (Dialing, Relaying) | (Relaying, Closed) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    RemoteClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: "normal close".to_string(),
        }
    }

    pub fn server_error(err: &impl fmt::Display) -> Self {
        let mut reason = err.to_string();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self {
            code: CLOSE_SERVER_ERROR,
            reason,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub target: Option<Target>,
    pub end: Option<SessionEnd>,
    pub error: Option<TunnelError>,
    pub stats: PipeStats,
}

impl SessionReport {
    /// Frame to close the client WebSocket with. `None` when the client
    /// already closed it.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        match (&self.error, self.end) {
            (Some(err), _) => Some(CloseFrame::server_error(err)),
            (None, Some(SessionEnd::ClientClosed)) => None,
            (None, _) => Some(CloseFrame::normal()),
        }
    }
}

/// Opens the downstream connection for a session.
pub trait Dialer {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn dial(&self, target: &Target) -> io::Result<Self::Stream>;
}

/// Dials through the Workers TCP socket API.
pub struct SocketDialer;

impl Dialer for SocketDialer {
    type Stream = Socket;

    async fn dial(&self, target: &Target) -> io::Result<Socket> {
        let socket = Socket::builder()
            .connect(target.dial_host(), target.port)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        socket
            .opened()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(socket)
    }
}

pub struct TunnelSession {
    state: SessionState,
    target: Option<Target>,
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Accepted,
            target: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn finish(mut self, outcome: Result<(SessionEnd, PipeStats), TunnelError>) -> SessionReport {
        let (end, stats, error) = match outcome {
            Ok((end, stats)) => {
                self.advance(SessionState::Closed);
                (Some(end), stats, None)
            }
            Err(err) => {
                self.advance(SessionState::Failed);
                (None, PipeStats::default(), Some(err))
            }
        };
        SessionReport {
            state: self.state,
            target: self.target,
            end,
            error,
            stats,
        }
    }

    /// Drive the session to a terminal state. The client stream is consumed;
    /// closing the client WebSocket is left to the caller, using
    /// [`SessionReport::close_frame`].
    pub async fn run<C, D, F>(mut self, client: C, resolve: F, dialer: &D) -> SessionReport
    where
        C: AsyncRead + AsyncWrite,
        D: Dialer,
        F: Future<Output = Result<Target, TunnelError>>,
    {
        self.advance(SessionState::Resolving);
        let target = match resolve.await {
            Ok(target) => target,
            Err(err) => return self.finish(Err(err)),
        };
        self.target = Some(target.clone());

        self.advance(SessionState::Dialing);
        let remote = match dialer.dial(&target).await {
            Ok(remote) => remote,
            Err(source) => {
                return self.finish(Err(TunnelError::Dial {
                    target: target.to_string(),
                    source,
                }));
            }
        };

        self.advance(SessionState::Relaying);
        let outcome = pipe(client, remote).await.map_err(TunnelError::from);
        self.finish(outcome)
    }
}

async fn forward<R, W>(reader: &mut R, writer: &mut W, counter: &Cell<u64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.set(counter.get() + n as u64);
    }
}

/// Copy bytes between `client` and `remote` until either side finishes.
/// `remote` is shut down and dropped before this returns.
pub async fn pipe<C, R>(client: C, remote: R) -> io::Result<(SessionEnd, PipeStats)>
where
    C: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);
    let up = Cell::new(0u64);
    let down = Cell::new(0u64);

    let result = {
        let upstream = forward(&mut client_rx, &mut remote_tx, &up);
        let downstream = forward(&mut remote_rx, &mut client_tx, &down);
        pin_mut!(upstream, downstream);
        match select(upstream, downstream).await {
            Either::Left((res, _)) => res.map(|_| SessionEnd::ClientClosed),
            Either::Right((res, _)) => res.map(|_| SessionEnd::RemoteClosed),
        }
    };

    let mut remote = remote_rx.unsplit(remote_tx);
    let _ = remote.shutdown().await;
    drop(remote);

    let stats = PipeStats {
        bytes_up: up.get(),
        bytes_down: down.get(),
    };
    result.map(|end| (end, stats))
}
