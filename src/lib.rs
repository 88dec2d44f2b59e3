pub mod config;
pub mod shared;
pub mod storage;
pub mod tests;
pub mod tickets;
pub mod transport;
pub mod web_server;
