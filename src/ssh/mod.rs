mod cache;
mod connection;

pub use cache::{ConnectionCache, ConnectionIdentity};
pub use connection::{
    ConnectParams, Connection, ConnectionState, SessionHandle, TrustHandler,
};
