// Administrative control channel.
//
// A second listener reactor, separate from the session port. A console's
// first frame must be an `AdminLogin` carrying the shared secret; anything
// else, or a wrong secret, earns a `Denied` reply and a close after flush.
// Accepted consoles join the admin roster with `Administrator` status.
//
// After login a console sends `Admin` frames holding one command line each
// (grammar in `boardroom_protocol::admin`). Replies go out as `Admin` text
// broadcast to every logged-in console, so concurrent operators see each
// other's actions.
//
// Commands act on the primary session server through `ServerControl`; the
// log commands work on the configured log file and the `LogControl` hook.
// The admin reactor owns the primary server's life: when it stops, for any
// reason, the primary server is stopped too.
//
// `AdminClient` is the blocking console side, used by `boardroom-admin`.

use std::fs::{self, OpenOptions};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use boardroom_protocol::{
    AdminCommand, AdminLogin, AdminLoginReply, DisconnectReason, Envelope, FrameError,
    RecipientFilter, Status, Tag, User, admin::USAGE, read_frame, write_frame,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::auth::SharedSecret;
use crate::client::{ClientError, HandshakeStage};
use crate::config::{AdminConfig, ClientConfig, ServerConfig};
use crate::connection::ConnectionHandle;
use crate::executor::HandlerError;
use crate::logging::LogControl;
use crate::reactor::{Handler, Reactor, ReactorConfig, ReactorError, ReactorHandle};
use crate::server::{LobbyRegistry, ServerHandle, SessionServer};

/// Lines per `Admin` envelope when sending the log file.
pub const LOG_CHUNK_LINES: usize = 100;

/// What the admin channel can do to the primary server.
pub trait ServerControl: Send + Sync + 'static {
    /// Start the server. Returns its address, or `None` if it was running.
    fn start(&self) -> io::Result<Option<SocketAddr>>;

    /// Stop the server. Returns false if it was not running.
    fn shutdown(&self) -> bool;

    /// The running server's lobbies.
    fn registry(&self) -> Option<LobbyRegistry>;
}

/// The session server, startable and stoppable at runtime.
pub struct PrimaryServer {
    config: ServerConfig,
    running: Mutex<Option<ServerHandle>>,
}

impl PrimaryServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Option<ServerHandle> {
        self.running.lock().clone()
    }
}

impl ServerControl for PrimaryServer {
    fn start(&self) -> io::Result<Option<SocketAddr>> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(ServerHandle::is_running) {
            return Ok(None);
        }
        let handle = SessionServer::start(&self.config)?;
        let addr = handle.addr();
        *running = Some(handle);
        Ok(Some(addr))
    }

    fn shutdown(&self) -> bool {
        let Some(handle) = self.running.lock().take() else {
            return false;
        };
        handle.stop();
        true
    }

    fn registry(&self) -> Option<LobbyRegistry> {
        self.running
            .lock()
            .as_ref()
            .filter(|handle| handle.is_running())
            .map(|handle| handle.registry().clone())
    }
}

/// Log file and filter hooks for the log commands.
#[derive(Clone, Default)]
pub struct LogAccess {
    pub file: Option<PathBuf>,
    pub control: Option<Arc<dyn LogControl>>,
}

struct AdminHandler {
    secret: SharedSecret,
    control: Arc<dyn ServerControl>,
    logs: LogAccess,
}

fn admin_text(text: impl Into<String>) -> Envelope {
    Envelope::text(Tag::Admin, text)
}

impl AdminHandler {
    fn login(&self, origin: &ConnectionHandle, envelope: &Envelope) -> Result<(), HandlerError> {
        let granted = envelope.tag() == Tag::AdminLogin
            && envelope
                .decode::<AdminLogin>()
                .is_ok_and(|login| self.secret.verify(&login.password));
        if granted {
            origin.set_user(User::new(format!("admin-{}", origin.id().0), Status::Administrator));
            info!(conn = %origin.id(), peer = %origin.peer(), "admin logged in");
            origin.send(Envelope::json(Tag::AdminReply, &AdminLoginReply::Accepted)?)?;
            return Ok(());
        }
        let reason = if envelope.tag() == Tag::AdminLogin {
            "wrong password"
        } else {
            "login required"
        };
        warn!(conn = %origin.id(), peer = %origin.peer(), reason, "admin login denied");
        origin.send(Envelope::json(
            Tag::AdminReply,
            &AdminLoginReply::Denied {
                reason: reason.into(),
            },
        )?)?;
        origin.close_when_flushed(DisconnectReason::ByServer);
        Ok(())
    }

    /// Run one command; each returned string becomes one reply envelope.
    fn execute(&self, command: &AdminCommand) -> Vec<String> {
        match command {
            AdminCommand::Start => vec![match self.control.start() {
                Ok(Some(addr)) => format!("server started on {addr}"),
                Ok(None) => "server already running".into(),
                Err(e) => format!("failed to start server: {e}"),
            }],
            AdminCommand::Shutdown => vec![if self.control.shutdown() {
                "server stopped".into()
            } else {
                "server not running".into()
            }],
            AdminCommand::GetLogFile => self.log_file(),
            AdminCommand::GetLogSize => vec![self.log_size()],
            AdminCommand::ClearLogFile => vec![self.clear_log()],
            AdminCommand::LogLevel { filter } => vec![match &self.logs.control {
                Some(control) => match control.set_filter(filter) {
                    Ok(()) => format!("log filter set to {filter}"),
                    Err(e) => e.to_string(),
                },
                None => "log filter cannot be changed".into(),
            }],
            AdminCommand::Help => vec![
                USAGE
                    .iter()
                    .map(|(syntax, description)| format!("{syntax:<42}{description}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ],
            registry_command => vec![match self.control.registry() {
                Some(registry) => self.execute_on(&registry, registry_command),
                None => "server not running".into(),
            }],
        }
    }

    fn execute_on(&self, registry: &LobbyRegistry, command: &AdminCommand) -> String {
        let outcome = match command {
            AdminCommand::Lobbies => {
                let lobbies = registry.list();
                if lobbies.is_empty() {
                    return "no lobbies".into();
                }
                return lobbies
                    .iter()
                    .map(|lobby| {
                        format!(
                            "{} ({} members{})",
                            lobby.name,
                            lobby.members,
                            if lobby.protected { ", password" } else { "" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            AdminCommand::ShutdownLobby { lobby } => registry
                .shutdown_lobby(lobby)
                .map(|()| format!("lobby {lobby} shut down")),
            AdminCommand::ChangeLobbyName { old, new } => registry
                .rename(old, new)
                .map(|()| format!("lobby {old} renamed to {new}")),
            AdminCommand::ChangeLobbyPassword { lobby, password } => registry
                .set_password(lobby, Some(password))
                .map(|()| format!("password of {lobby} changed")),
            AdminCommand::Kick { lobby, user } => registry
                .kick(lobby, user)
                .map(|()| format!("{user} kicked from {lobby}")),
            AdminCommand::Ban { lobby, user } => registry
                .ban(lobby, user)
                .map(|_| format!("{user} banned from {lobby}")),
            AdminCommand::Unban { lobby, user } => registry.unban(lobby, user).map(|lifted| {
                if lifted {
                    format!("{user} unbanned from {lobby}")
                } else {
                    format!("{user} was not banned from {lobby}")
                }
            }),
            other => return format!("{other} is not a lobby command"),
        };
        outcome.unwrap_or_else(|e| e.to_string())
    }

    fn log_file(&self) -> Vec<String> {
        let Some(path) = &self.logs.file else {
            return vec!["no log file configured".into()];
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => return vec![format!("failed to read {}: {e}", path.display())],
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            return vec!["log file is empty".into()];
        }
        lines
            .chunks(LOG_CHUNK_LINES)
            .map(|chunk| chunk.join("\n"))
            .collect()
    }

    fn log_size(&self) -> String {
        let Some(path) = &self.logs.file else {
            return "no log file configured".into();
        };
        match fs::read(path) {
            Ok(bytes) => {
                let lines = String::from_utf8_lossy(&bytes).lines().count();
                format!("{lines} lines, {} bytes", bytes.len())
            }
            Err(e) => format!("failed to read {}: {e}", path.display()),
        }
    }

    fn clear_log(&self) -> String {
        let Some(path) = &self.logs.file else {
            return "no log file configured".into();
        };
        match OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(0))
        {
            Ok(()) => "log file cleared".into(),
            Err(e) => format!("failed to clear {}: {e}", path.display()),
        }
    }
}

impl Handler for AdminHandler {
    fn on_envelope(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        if origin.status() != Some(Status::Administrator) {
            return self.login(origin, &envelope);
        }
        if envelope.tag() != Tag::Admin {
            return Err(HandlerError::UnexpectedTag(envelope.tag()));
        }
        let line = envelope.as_text()?;
        let replies = match line.parse::<AdminCommand>() {
            Ok(command) => {
                info!(conn = %origin.id(), %command, "admin command");
                self.execute(&command)
            }
            Err(e) => {
                warn!(conn = %origin.id(), error = %e, "bad admin command");
                vec![e.to_string()]
            }
        };
        for reply in replies {
            reactor.broadcast(admin_text(reply), RecipientFilter::all(Status::Administrator));
        }
        Ok(())
    }

    fn on_disconnect(
        &self,
        _reactor: &ReactorHandle,
        connection: &ConnectionHandle,
        reason: &DisconnectReason,
    ) {
        if connection.status().is_some() {
            info!(conn = %connection.id(), %reason, "admin logged out");
        }
    }

    fn on_fatal(&self, _reactor: &ReactorHandle, error: &ReactorError) {
        error!(error = %error, "admin channel failed; stopping session server");
        self.control.shutdown();
    }
}

/// Running admin listener.
pub struct AdminServer {
    reactor: ReactorHandle,
    control: Arc<dyn ServerControl>,
    addr: SocketAddr,
}

impl AdminServer {
    pub fn start(
        config: &AdminConfig,
        password: &str,
        control: Arc<dyn ServerControl>,
        logs: LogAccess,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr())?;
        let addr = listener.local_addr()?;
        let handler = Arc::new(AdminHandler {
            secret: SharedSecret::new(password),
            control: Arc::clone(&control),
            logs,
        });
        let reactor = Reactor::spawn(ReactorConfig::new("admin"), Some(listener), handler)?;
        info!(%addr, "admin channel listening");
        Ok(Self {
            reactor,
            control,
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    /// Stop the admin listener and the primary server with it.
    pub fn stop(&self) {
        self.reactor.shutdown();
        self.reactor.join();
        self.control.shutdown();
    }

    /// Wait for the admin reactor to stop, then stop the primary server.
    pub fn join(&self) {
        self.reactor.join();
        self.control.shutdown();
    }
}

/// Blocking admin console connection.
pub struct AdminClient {
    stream: TcpStream,
    max_message_size: usize,
}

fn timed_out(error: &FrameError) -> bool {
    matches!(error, FrameError::Io(e)
        if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
}

impl AdminClient {
    pub fn connect(
        addr: SocketAddr,
        password: &str,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let mut stream =
            TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    ClientError::Timeout {
                        stage: HandshakeStage::Connect,
                    }
                } else {
                    ClientError::Io(e)
                }
            })?;
        stream.set_write_timeout(Some(config.response_timeout))?;
        stream.set_read_timeout(Some(config.response_timeout))?;

        let login = AdminLogin {
            password: password.to_owned(),
        };
        write_frame(&mut stream, &Envelope::json(Tag::AdminLogin, &login)?)?;
        let reply = match read_frame(&mut stream, config.max_message_size) {
            Ok(reply) => reply,
            Err(e) if timed_out(&e) => {
                return Err(ClientError::Timeout {
                    stage: HandshakeStage::Response,
                });
            }
            Err(FrameError::Eof) => return Err(ClientError::Closed),
            Err(e) => return Err(e.into()),
        };
        if reply.tag() != Tag::AdminReply {
            return Err(ClientError::Unexpected(reply.tag()));
        }
        match reply.decode::<AdminLoginReply>()? {
            AdminLoginReply::Accepted => {}
            AdminLoginReply::Denied { reason } => return Err(ClientError::Rejected(reason)),
        }
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        Ok(Self {
            stream,
            max_message_size: config.max_message_size,
        })
    }

    /// Send one command line.
    pub fn send(&mut self, line: &str) -> Result<(), ClientError> {
        write_frame(&mut self.stream, &admin_text(line))?;
        Ok(())
    }

    /// Next reply line. `None` if nothing arrives within `timeout`; a `None`
    /// timeout waits indefinitely.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<String>, ClientError> {
        self.stream.set_read_timeout(timeout)?;
        match read_frame(&mut self.stream, self.max_message_size) {
            Ok(reply) if reply.tag() == Tag::Admin => match reply.as_text() {
                Ok(text) => Ok(Some(text.to_owned())),
                Err(_) => Err(ClientError::Unexpected(Tag::Admin)),
            },
            Ok(reply) => Err(ClientError::Unexpected(reply.tag())),
            Err(e) if timed_out(&e) => Ok(None),
            Err(FrameError::Eof) => Err(ClientError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Second handle on the same connection, e.g. for a reader thread.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            max_message_size: self.max_message_size,
        })
    }
}
