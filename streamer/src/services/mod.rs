//! Streamer services implementations

pub mod connection_manager;
pub mod url_files;
pub mod websocket_connector;

#[cfg(test)]
pub mod tests;

pub use connection_manager::*;
pub use url_files::*;
pub use websocket_connector::*;
