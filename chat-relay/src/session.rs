//! Per-connection state and the worker that drives it.
//!
//! A session walks `Connecting -> Handshaking -> Active -> Closing -> Closed`.
//! The first frame a client sends is its username; every later non-empty
//! frame is chat text relayed to the other active sessions. Any read failure,
//! an explicit [`Session::close`], or server shutdown ends the loop, after which
//! the worker deregisters the session, republishes the roster and shuts the
//! connection down.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    codec::{FrameCodec, FrameReader, FrameWriter, read_message, write_message},
    error::FrameError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Handshaking = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Connecting,
            1 => SessionState::Handshaking,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    username: OnceLock<String>,
    state: AtomicU8,
    // One writer at a time: the session's own worker and every fan-out
    // targeting this connection go through this lock.
    writer: Mutex<FrameWriter<BoxedWriter>>,
    closer: CancellationToken,
    released: AtomicBool,
}

impl Session {
    /// `outbound` bounds every frame written to this client; see
    /// [`Session::send`].
    pub fn new<W>(
        id: SessionId,
        peer: Option<SocketAddr>,
        writer: W,
        outbound: FrameCodec,
        closer: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id,
            peer,
            username: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            writer: Mutex::new(FrameWriter::new(writer, outbound)),
            closer,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// `None` until the handshake frame has been read.
    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Active sessions appear in the roster and receive chat fan-out.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Writes one frame to the client. Concurrent callers are serialized.
    ///
    /// A message over the outbound limit fails with
    /// [`FrameError::FrameTooLarge`] and nothing reaches the socket. Closing
    /// the session aborts a pending send with [`FrameError::TransportClosed`].
    pub async fn send(&self, message: &str) -> Result<(), FrameError> {
        select! {
            biased;
            _ = self.closer.cancelled() => Err(FrameError::TransportClosed),
            result = async {
                let mut writer = self.writer.lock().await;
                write_message(&mut writer, message).await
            } => result,
        }
    }

    /// Asks the worker to wind the session down. Safe to call any number of
    /// times from any task.
    pub fn close(&self) {
        self.closer.cancel();
    }

    fn set_username(&self, username: String) -> bool {
        self.username.set(username).is_ok()
    }

    fn transition(&self, next: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        debug!(session = %self.id, ?previous, ?next, "session state changed");
    }

    #[cfg(test)]
    pub(crate) fn activate_for_test(&self, username: &str) {
        self.set_username(username.to_string());
        self.transition(SessionState::Active);
    }

    /// Shuts the write half down. Only the first call touches the socket.
    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.get_mut().shutdown().await {
            debug!(session = %self.id, error = %err, "connection shutdown failed");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("username", &self.username())
            .field("state", &self.state())
            .finish()
    }
}

/// Runs one session to completion. The session must already be registered.
pub async fn run<R>(session: Arc<Session>, reader: R, broadcaster: Arc<Broadcaster>, max_frame_len: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(reader, FrameCodec::new(max_frame_len));

    match serve(&session, &mut reader, &broadcaster).await {
        Ok(()) => debug!(session = %session.id(), "session ended"),
        Err(err) if err.is_disconnect() => {
            debug!(session = %session.id(), error = %err, "client disconnected")
        }
        Err(err) => warn!(session = %session.id(), peer = ?session.peer(), error = %err, "closing session"),
    }

    session.transition(SessionState::Closing);
    session.close();

    match broadcaster.registry().remove(session.id()).await {
        Ok(_) => {
            if let Some(username) = session.username() {
                info!(session = %session.id(), username, "user left");
                broadcaster.publish_roster().await;
            }
        }
        Err(err) => debug!(session = %session.id(), error = %err, "session already deregistered"),
    }

    drop(reader);
    session.release().await;
    session.transition(SessionState::Closed);
}

async fn serve<R>(
    session: &Session,
    reader: &mut FrameReader<R>,
    broadcaster: &Broadcaster,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    session.transition(SessionState::Handshaking);
    let Some(username) = next_message(session, reader).await? else {
        return Ok(());
    };

    info!(session = %session.id(), peer = ?session.peer(), username = %username, "user joined");
    session.set_username(username);
    session.transition(SessionState::Active);
    broadcaster.publish_roster().await;

    while let Some(text) = next_message(session, reader).await? {
        if text.is_empty() {
            continue;
        }
        debug!(session = %session.id(), len = text.len(), "relaying chat message");
        broadcaster.send_to_others(session.id(), &text).await;
    }

    Ok(())
}

async fn next_message<R>(session: &Session, reader: &mut FrameReader<R>) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    select! {
        biased;
        _ = session.closer.cancelled() => Ok(None),
        message = read_message(reader) => message,
    }
}
