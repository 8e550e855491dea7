//! Connection flavours, the client registry, presence, and shutdown
//! coordination.

mod conn;
mod registry;
mod server;
mod shutdown;

pub use conn::{read_packet, Conn, DuplexTransport, StatefulConn, StatelessConn, Transport};
pub use registry::{ConnManager, Presence};
pub use server::Server;
pub use shutdown::{ShutdownController, TaskGuard};
