// Primary session server: the public listener and the lobby registry.
//
// Every accepted socket starts on the gatekeeper reactor. Reads pause after
// the first frame, which must be a `Hello`. The gatekeeper validates it on
// its executor thread and either hands the socket to the chosen lobby
// (creating the lobby first if asked) or sends `Rejected` and closes after
// the reply is flushed. Nothing past the `Hello` is read on this reactor, so
// whatever the client sends next lands in the lobby.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use boardroom_protocol::{DisconnectReason, Envelope, HandshakeReply, Hello, Status, Tag, User};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::executor::HandlerError;
use crate::lobby::Lobby;
use crate::reactor::{Abandoned, Handler, Reactor, ReactorConfig, ReactorError, ReactorHandle};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("lobby name cannot be empty")]
    EmptyName,
    #[error("lobby {0:?} already exists")]
    Exists(String),
    #[error("no lobby named {0:?}")]
    NotFound(String),
    #[error("no user {user:?} in lobby {lobby:?}")]
    NoSuchUser { lobby: String, user: String },
    #[error("failed to start lobby: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LobbySummary {
    pub name: String,
    pub members: usize,
    pub protected: bool,
}

/// Live lobbies by name. Closed lobbies are dropped whenever they are
/// looked up or listed.
#[derive(Clone)]
pub struct LobbyRegistry {
    lobbies: Arc<DashMap<String, Lobby>>,
    max_message_size: usize,
}

impl LobbyRegistry {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            lobbies: Arc::new(DashMap::new()),
            max_message_size,
        }
    }

    pub fn create(&self, name: &str, password: Option<&str>) -> Result<Lobby, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let entry = self.lobbies.entry(name.to_owned());
        if let Entry::Occupied(existing) = &entry {
            if existing.get().is_open() {
                return Err(RegistryError::Exists(name.to_owned()));
            }
        }
        let lobby = Lobby::spawn(name, password, self.max_message_size)?;
        entry.insert(lobby.clone());
        info!(lobby = %name, protected = password.is_some(), "lobby created");
        Ok(lobby)
    }

    pub fn get(&self, name: &str) -> Option<Lobby> {
        let lobby = self.lobbies.get(name).map(|entry| entry.value().clone())?;
        if lobby.is_open() {
            return Some(lobby);
        }
        self.lobbies.remove_if(name, |_, lobby| !lobby.is_open());
        None
    }

    fn require(&self, name: &str) -> Result<Lobby, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    pub fn list(&self) -> Vec<LobbySummary> {
        self.lobbies.retain(|_, lobby| lobby.is_open());
        let mut summaries: Vec<LobbySummary> = self
            .lobbies
            .iter()
            .map(|entry| LobbySummary {
                name: entry.key().clone(),
                members: entry.value().member_count(),
                protected: entry.value().has_password(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), RegistryError> {
        if new.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let lobby = self.require(old)?;
        if old == new {
            return Ok(());
        }
        match self.lobbies.entry(new.to_owned()) {
            Entry::Occupied(existing) if existing.get().is_open() => {
                return Err(RegistryError::Exists(new.to_owned()));
            }
            entry => {
                entry.insert(lobby.clone());
            }
        }
        if self
            .lobbies
            .remove_if(old, |_, held| held.same_as(&lobby))
            .is_none()
        {
            // Renamed concurrently; keep the other rename.
            self.lobbies.remove_if(new, |_, held| held.same_as(&lobby));
            return Err(RegistryError::NotFound(old.to_owned()));
        }
        lobby.set_name(new);
        Ok(())
    }

    pub fn set_password(&self, lobby: &str, password: Option<&str>) -> Result<(), RegistryError> {
        self.require(lobby)?.set_password(password);
        Ok(())
    }

    pub fn kick(&self, lobby: &str, user: &str) -> Result<(), RegistryError> {
        if self.require(lobby)?.kick(user) {
            Ok(())
        } else {
            Err(RegistryError::NoSuchUser {
                lobby: lobby.to_owned(),
                user: user.to_owned(),
            })
        }
    }

    /// Returns whether a current member was removed by the ban.
    pub fn ban(&self, lobby: &str, user: &str) -> Result<bool, RegistryError> {
        Ok(self.require(lobby)?.ban(user))
    }

    /// Returns whether the user was banned.
    pub fn unban(&self, lobby: &str, user: &str) -> Result<bool, RegistryError> {
        Ok(self.require(lobby)?.unban(user))
    }

    pub fn shutdown_lobby(&self, name: &str) -> Result<(), RegistryError> {
        let lobby = self.require(name)?;
        self.lobbies.remove(name);
        lobby.shutdown();
        Ok(())
    }

    /// Remove every lobby and stop it. Returns the stopped lobbies so the
    /// caller can wait for them.
    pub fn shutdown_all(&self) -> Vec<Lobby> {
        let names: Vec<String> = self.lobbies.iter().map(|entry| entry.key().clone()).collect();
        let stopped: Vec<Lobby> = names
            .iter()
            .filter_map(|name| self.lobbies.remove(name).map(|(_, lobby)| lobby))
            .collect();
        for lobby in &stopped {
            lobby.shutdown();
        }
        stopped
    }
}

impl std::fmt::Debug for LobbyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyRegistry")
            .field("lobbies", &self.lobbies.len())
            .finish()
    }
}

fn valid_username(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

struct Gatekeeper {
    registry: LobbyRegistry,
    protocol_version: u32,
}

impl Gatekeeper {
    /// Pick the lobby and initial user for a `Hello`, or say why not.
    fn admit(&self, hello: &Hello) -> Result<(Lobby, User), String> {
        if hello.protocol_version != self.protocol_version {
            return Err(format!(
                "protocol version {} is not supported (server speaks {})",
                hello.protocol_version, self.protocol_version
            ));
        }
        if !valid_username(&hello.username) {
            return Err("username must be non-empty and contain no whitespace".into());
        }

        if hello.create {
            let lobby = self
                .registry
                .create(&hello.lobby, hello.lobby_password.as_deref())
                .map_err(|e| e.to_string())?;
            return Ok((lobby, User::new(hello.username.clone(), Status::LobbyRoot)));
        }

        let lobby = self
            .registry
            .get(&hello.lobby)
            .ok_or_else(|| format!("no lobby named {:?}", hello.lobby))?;
        if !lobby.check_password(hello.lobby_password.as_deref()) {
            return Err("wrong lobby password".into());
        }
        if lobby.is_banned(&hello.username) {
            return Err("banned from lobby".into());
        }
        Ok((lobby, User::new(hello.username.clone(), Status::Common)))
    }
}

impl Handler for Gatekeeper {
    fn on_envelope(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        if envelope.tag() != Tag::Handshake {
            return Err(HandlerError::UnexpectedTag(envelope.tag()));
        }
        let hello: Hello = envelope.decode()?;
        match self.admit(&hello) {
            Ok((lobby, user)) => {
                info!(
                    conn = %origin.id(),
                    peer = %origin.peer(),
                    user = %user.name,
                    lobby = %lobby.name(),
                    create = hello.create,
                    "handshake accepted"
                );
                let abandoned = if hello.create {
                    let created = lobby.clone();
                    Abandoned::new(move || {
                        if created.member_count() == 0 {
                            warn!(lobby = %created.name(), "creator never arrived; closing lobby");
                            created.shutdown();
                        }
                    })
                } else {
                    Abandoned::none()
                };
                if !reactor.transfer(origin.id(), lobby.reactor(), Some(user), abandoned) {
                    warn!(conn = %origin.id(), "server stopped before the handshake completed");
                }
            }
            Err(reason) => {
                info!(
                    conn = %origin.id(),
                    peer = %origin.peer(),
                    user = %hello.username,
                    lobby = %hello.lobby,
                    %reason,
                    "handshake rejected"
                );
                origin.send(Envelope::json(
                    Tag::HandshakeReply,
                    &HandshakeReply::Rejected { reason },
                )?)?;
                origin.close_when_flushed(DisconnectReason::ByServer);
            }
        }
        Ok(())
    }

    fn on_fatal(&self, _reactor: &ReactorHandle, error: &ReactorError) {
        let stopped = self.registry.shutdown_all();
        error!(%error, lobbies = stopped.len(), "session listener failed; lobbies closed");
    }
}

pub struct SessionServer;

impl SessionServer {
    /// Bind the session listener and start the gatekeeper reactor.
    pub fn start(config: &ServerConfig) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(config.listen_addr())?;
        let addr = listener.local_addr()?;
        let registry = LobbyRegistry::new(config.max_message_size);
        let gatekeeper = Arc::new(Gatekeeper {
            registry: registry.clone(),
            protocol_version: config.protocol_version,
        });
        let reactor_config = ReactorConfig::new("server")
            .pause_after_read()
            .with_max_message_size(config.max_message_size);
        let reactor = Reactor::spawn(reactor_config, Some(listener), gatekeeper)?;
        info!(%addr, "session server listening");
        Ok(ServerHandle {
            reactor,
            registry,
            addr,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ServerHandle {
    reactor: ReactorHandle,
    registry: LobbyRegistry,
    addr: SocketAddr,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &LobbyRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    /// Stop accepting, close every lobby and wait for all of it to finish.
    pub fn stop(&self) {
        info!(addr = %self.addr, "session server stopping");
        self.reactor.shutdown();
        for lobby in self.registry.shutdown_all() {
            lobby.join();
        }
        self.reactor.join();
    }

    /// Wait for the listener reactor to stop.
    pub fn join(&self) {
        self.reactor.join();
    }
}
