// boardroom_relay: reactor-driven session server for Boardroom.
//
// Collaborators connect over TCP, say `Hello`, and are placed in a named
// lobby. The server relays their commands and chat to the rest of the lobby
// without interpreting them. A separate admin port lets an operator list,
// rename and close lobbies, kick or ban users, and manage the log.
//
// Module overview:
// - `reactor.rs`:    One `mio::Poll` per reactor; the I/O thread, the
//                    `Handler` trait and the cross-thread control surface.
// - `executor.rs`:   The per-reactor thread that runs handlers on assembled
//                    envelopes.
// - `connection.rs`: `Connection` (socket + framing state, owned by one
//                    reactor) and `ConnectionHandle` (shared identity and
//                    outbound queue).
// - `lobby.rs`:      A lobby: roster, name collisions, authorization.
// - `server.rs`:     Gatekeeper listener, `LobbyRegistry`, `SessionServer`.
// - `client.rs`:     Deadline-bounded handshake and a client-side reactor.
// - `admin.rs`:      Admin listener, command execution, `AdminClient`.
// - `auth.rs`:       Password digests.
// - `config.rs`:     TOML configuration and client timeouts.
// - `logging.rs`:    Tracing subscriber with a reloadable filter.
//
// Threading: every reactor (gatekeeper, each lobby, admin, each client) is
// two threads. No thread other than a reactor's own I/O thread ever touches
// its sockets; everything else goes through channels plus a waker.

pub mod admin;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod executor;
pub mod lobby;
pub mod logging;
pub mod reactor;
pub mod server;

pub use admin::{AdminClient, AdminServer, LogAccess, PrimaryServer, ServerControl};
pub use client::{Client, ClientError, ClientEvent, ClientListener, Inbox, WelcomeInfo};
pub use config::{ClientConfig, Config};
pub use executor::HandlerError;
pub use lobby::Lobby;
pub use server::{LobbyRegistry, ServerHandle, SessionServer};
