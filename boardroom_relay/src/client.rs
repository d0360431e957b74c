// Client side of the session protocol.
//
// `Client::connect()` does the whole handshake on the calling thread:
// - a non-blocking TCP connect, polled until it completes or the connect
//   deadline passes;
// - the `Hello` written and the `HandshakeReply` read through the same
//   `FrameWriter` / `FrameReader` the reactors use, under a response
//   deadline.
//
// After a `Welcome`, the socket moves into a private single-connection
// reactor. Its executor hands every envelope to the caller's
// `ClientListener` in arrival order, then reports the disconnect once. The
// caller sends through the client from any thread; writes are queued and
// flushed by the reactor, so sending never blocks on the network.
//
// `Inbox` is a ready-made listener that forwards into a channel for callers
// that would rather poll.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use boardroom_protocol::{
    ConnectionId, DisconnectReason, Envelope, FrameError, FrameReader, FrameWriter,
    HandshakeReply, Hello, LobbyEvent, Member, ReadProgress, SessionRequest, Status, Tag, User,
    WriteProgress,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionHandle, SendError};
use crate::executor::HandlerError;
use crate::reactor::{Handler, Reactor, ReactorConfig, ReactorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStage {
    Connect,
    Send,
    Response,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeStage::Connect => "connect",
            HandshakeStage::Send => "handshake send",
            HandshakeStage::Response => "handshake response",
        })
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("timed out during {stage}")]
    Timeout { stage: HandshakeStage },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("reply did not decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected {0:?} reply")]
    Unexpected(Tag),
    #[error("connection closed")]
    Closed,
}

impl From<SendError> for ClientError {
    fn from(_: SendError) -> Self {
        ClientError::Closed
    }
}

/// Receives everything that arrives after the handshake. Called on the
/// client's executor thread.
pub trait ClientListener: Send + Sync + 'static {
    fn on_event(&self, tag: Tag, envelope: &Envelope);

    /// Called once, after the last `on_event`.
    fn on_disconnect(&self, reason: &DisconnectReason);
}

#[derive(Debug)]
pub enum ClientEvent {
    Envelope(Envelope),
    Disconnected(DisconnectReason),
}

/// Listener that queues events for polling.
pub struct Inbox {
    tx: Sender<ClientEvent>,
}

impl Inbox {
    pub fn channel() -> (Arc<Self>, Receiver<ClientEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl ClientListener for Inbox {
    fn on_event(&self, _tag: Tag, envelope: &Envelope) {
        let _ = self.tx.send(ClientEvent::Envelope(envelope.clone()));
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        let _ = self.tx.send(ClientEvent::Disconnected(reason.clone()));
    }
}

/// What the server said in its `Welcome`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WelcomeInfo {
    pub connection_id: ConnectionId,
    pub username: String,
    pub lobby: String,
    pub status: Status,
    pub members: Vec<Member>,
}

const HANDSHAKE: Token = Token(0);

/// Deadline-bounded I/O on a socket before it joins a reactor.
struct Handshake {
    poll: Poll,
    events: Events,
}

impl Handshake {
    fn new(stream: &mut TcpStream) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(stream, HANDSHAKE, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Block until the socket may be ready again, or fail once `deadline`
    /// has passed.
    fn wait(&mut self, deadline: Instant, stage: HandshakeStage) -> Result<(), ClientError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(ClientError::Timeout { stage })?;
        match self.poll.poll(&mut self.events, Some(remaining)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn connect(&mut self, stream: &TcpStream, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(e) = stream.take_error()? {
                return Err(e.into());
            }
            match stream.peer_addr() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
            self.wait(deadline, HandshakeStage::Connect)?;
        }
    }

    /// Write `request`, then read exactly one reply frame.
    fn exchange(
        &mut self,
        stream: &mut TcpStream,
        request: &Envelope,
        config: &ClientConfig,
    ) -> Result<Envelope, ClientError> {
        let deadline = Instant::now() + config.response_timeout;

        let mut writer = FrameWriter::new(config.max_message_size);
        writer.load(request)?;
        loop {
            match writer.write_to(stream)? {
                WriteProgress::Complete | WriteProgress::Idle => break,
                WriteProgress::Pending => self.wait(deadline, HandshakeStage::Send)?,
            }
        }

        let mut reader = FrameReader::new(config.max_message_size);
        loop {
            match reader.read_from(stream) {
                Ok(ReadProgress::Complete(reply)) => return Ok(reply),
                Ok(ReadProgress::Pending) => self.wait(deadline, HandshakeStage::Response)?,
                Err(FrameError::Eof) => return Err(ClientError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish(self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }
}

/// Connect and trade one request for one reply. The returned stream is
/// connected, deregistered and positioned right after the reply frame.
fn handshake(
    addr: SocketAddr,
    request: &Envelope,
    config: &ClientConfig,
) -> Result<(TcpStream, Envelope), ClientError> {
    let mut stream = TcpStream::connect(addr)?;
    let mut handshake = Handshake::new(&mut stream)?;
    handshake.connect(&stream, config.connect_timeout)?;
    let reply = handshake.exchange(&mut stream, request, config)?;
    handshake.finish(&mut stream)?;
    Ok((stream, reply))
}

struct ClientHandler {
    listener: Arc<dyn ClientListener>,
    /// Reason from the server's last `Disconnected` notice, if any.
    notice: Mutex<Option<DisconnectReason>>,
    /// Set once `Goodbye` is queued; the server's close is then ours.
    leaving: AtomicBool,
}

impl Handler for ClientHandler {
    fn on_envelope(
        &self,
        _reactor: &ReactorHandle,
        _origin: &ConnectionHandle,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        if envelope.tag() == Tag::Lobby {
            if let Ok(LobbyEvent::Disconnected { reason }) = envelope.decode() {
                *self.notice.lock() = Some(reason);
            }
        }
        self.listener.on_event(envelope.tag(), &envelope);
        Ok(())
    }

    fn on_disconnect(
        &self,
        reactor: &ReactorHandle,
        _connection: &ConnectionHandle,
        reason: &DisconnectReason,
    ) {
        let reason = match reason {
            DisconnectReason::PeerClosed if self.leaving.load(Ordering::Acquire) => {
                DisconnectReason::ByUser
            }
            DisconnectReason::PeerClosed => self
                .notice
                .lock()
                .take()
                .unwrap_or(DisconnectReason::ByServer),
            other => other.clone(),
        };
        debug!(%reason, "client disconnected");
        self.listener.on_disconnect(&reason);
        reactor.shutdown();
    }
}

/// A connected lobby member.
pub struct Client {
    reactor: ReactorHandle,
    connection: ConnectionHandle,
    handler: Arc<ClientHandler>,
}

impl Client {
    /// Connect to a session server and join or create the lobby named in
    /// `hello`.
    pub fn connect(
        addr: SocketAddr,
        hello: &Hello,
        listener: Arc<dyn ClientListener>,
        config: &ClientConfig,
    ) -> Result<(Self, WelcomeInfo), ClientError> {
        let request = Envelope::json(Tag::Handshake, hello)?;
        let (stream, reply) = handshake(addr, &request, config)?;
        if reply.tag() != Tag::HandshakeReply {
            return Err(ClientError::Unexpected(reply.tag()));
        }
        let welcome = match reply.decode::<HandshakeReply>()? {
            HandshakeReply::Welcome {
                connection_id,
                username,
                lobby,
                status,
                members,
            } => WelcomeInfo {
                connection_id,
                username,
                lobby,
                status,
                members,
            },
            HandshakeReply::Rejected { reason } => return Err(ClientError::Rejected(reason)),
        };
        info!(
            %addr,
            user = %welcome.username,
            lobby = %welcome.lobby,
            status = %welcome.status,
            "joined lobby"
        );

        let handler = Arc::new(ClientHandler {
            listener,
            notice: Mutex::new(None),
            leaving: AtomicBool::new(false),
        });
        let reactor_config =
            ReactorConfig::new(format!("client-{}", welcome.username))
                .with_max_message_size(config.max_message_size);
        let reactor = Reactor::spawn(reactor_config, None, handler.clone())?;
        let connection = Connection::new(stream, config.max_message_size)?;
        let user = User::new(welcome.username.clone(), welcome.status);
        let connection = match reactor.register(connection, Some(user)) {
            Ok(handle) => handle,
            Err(_) => {
                reactor.shutdown();
                return Err(ClientError::Closed);
            }
        };
        Ok((
            Self {
                reactor,
                connection,
                handler,
            },
            welcome,
        ))
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        Ok(self.connection.send(envelope)?)
    }

    pub fn send_session(&self, request: &SessionRequest) -> Result<(), ClientError> {
        self.send(Envelope::json(Tag::Session, request)?)
    }

    pub fn chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send_session(&SessionRequest::Chat { text: text.into() })
    }

    /// Relay an opaque command to the whole lobby.
    pub fn command(&self, payload: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.send_session(&SessionRequest::Command {
            payload: payload.into(),
        })
    }

    /// Say goodbye; the server closes the connection in response and the
    /// listener sees `ByUser`. Dropping the client closes it outright.
    pub fn disconnect(&self) {
        self.handler.leaving.store(true, Ordering::Release);
        if self.connection.send(Envelope::empty(Tag::Goodbye)).is_err() {
            self.connection.disconnect(DisconnectReason::ByUser);
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed() && self.reactor.is_running()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Wait for the client's reactor to stop.
    pub fn join(&self) {
        self.reactor.join();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reactor.shutdown();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("user", &self.connection.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}
