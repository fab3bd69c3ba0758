//! Raw transport takeover for relayed responses
//!
//! A relayed reply is a complete, already-framed HTTP response. It has to
//! reach the public client byte for byte, so it cannot go through hyper's
//! response writer. [`TakeoverIo`] wraps the accepted stream; a request
//! handler holding the matching [`Takeover`] can claim the stream with the
//! raw bytes. From then on everything hyper writes is swallowed and the
//! claimed bytes are written instead, followed by the normal shutdown.
//!
//! Claiming is only safe while hyper has not written any part of a response
//! on the connection. The server guarantees this by serving one request per
//! connection, and a claim can happen at most once.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
enum State {
    Passthrough,
    Claimed(Bytes),
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum TakeoverError {
    #[error("Connection was already taken over")]
    AlreadyClaimed,
}

/// Handle that lets a request handler take over the connection's write side
#[derive(Clone)]
pub struct Takeover {
    state: Arc<Mutex<State>>,
}

impl Takeover {
    /// Replace the response on this connection with `raw`
    pub fn claim(&self, raw: Bytes) -> Result<(), TakeoverError> {
        let mut state = self.state.lock();
        match *state {
            State::Passthrough => {
                *state = State::Claimed(raw);
                Ok(())
            }
            _ => Err(TakeoverError::AlreadyClaimed),
        }
    }

    pub fn is_claimed(&self) -> bool {
        !matches!(*self.state.lock(), State::Passthrough)
    }
}

/// Stream wrapper implementing the takeover
pub struct TakeoverIo<S> {
    inner: S,
    state: Arc<Mutex<State>>,
}

impl<S> TakeoverIo<S> {
    pub fn new(inner: S) -> (Self, Takeover) {
        let state = Arc::new(Mutex::new(State::Passthrough));
        let takeover = Takeover {
            state: state.clone(),
        };
        (Self { inner, state }, takeover)
    }
}

/// Write out whatever is left of the claimed bytes
fn drain<S: AsyncWrite + Unpin>(
    inner: &mut S,
    state: &mut State,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    loop {
        let remaining = match state {
            State::Claimed(remaining) => remaining,
            _ => return Poll::Ready(Ok(())),
        };
        if remaining.is_empty() {
            *state = State::Done;
            return Poll::Ready(Ok(()));
        }
        let written = ready!(Pin::new(&mut *inner).poll_write(cx, &remaining[..]))?;
        if written == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        remaining.advance(written);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TakeoverIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TakeoverIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let TakeoverIo { inner, state } = self.get_mut();
        let mut state = state.lock();
        if let State::Passthrough = *state {
            drop(state);
            return Pin::new(inner).poll_write(cx, buf);
        }
        ready!(drain(inner, &mut state, cx))?;
        // Structured output after a takeover is discarded
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let TakeoverIo { inner, state } = self.get_mut();
        ready!(drain(inner, &mut state.lock(), cx))?;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let TakeoverIo { inner, state } = self.get_mut();
        ready!(drain(inner, &mut state.lock(), cx))?;
        Pin::new(inner).poll_shutdown(cx)
    }
}
