//! Socket server: ASCII line protocol over TCP, backed by the ring
//! buffer for live subscriptions and the archive reader for historical
//! reads.

pub mod protocol;
pub mod server;
pub mod session;

pub use server::NetworkServer;
pub use session::ServerState;
