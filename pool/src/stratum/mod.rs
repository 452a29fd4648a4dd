pub mod connection;
pub mod protocol;
pub mod proxy_protocol;
pub mod server;

pub use connection::StratumConnection;
pub use protocol::{StratumError, StratumNotification, StratumRequest, StratumResponse};
pub use server::{ListenerOptions, StratumHandler, StratumServer};
