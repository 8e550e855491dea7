//! Courier Server -- broker core, channels, routing, and storage.
//!
//! The server crate hosts the message-routing and delivery engine:
//!
//! - **Broker** ([`broker`]): the central event loop, channel cache, and
//!   offline drain
//! - **Router** ([`router`]): middleware chain plus packet/command match
//!   table over pooled routing contexts
//! - **Network** ([`network`]): connection flavours, the client registry,
//!   presence, and shutdown coordination
//! - **Storage** ([`storage`]): the persistence seam and the in-memory
//!   backend
//! - **Handlers** ([`handlers`]): the default packet handlers wired by
//!   [`handlers::default_router`]

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod network;
pub mod router;
pub mod storage;

pub use broker::{AuthenticatedContext, Broker, Channel, PacketContext};
pub use config::ServerConfig;
pub use error::BrokerError;
pub use handlers::default_router;
pub use network::{
    Conn, ConnManager, DuplexTransport, Presence, Server, ShutdownController, StatefulConn,
    StatelessConn, Transport,
};
pub use router::{handler_fn, Handler, HandlerFuture, MContext, MatchKey, Router};
pub use storage::{MemoryStorage, Storage};
