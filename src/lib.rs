pub mod cache;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod sweeper;
pub mod time;
pub mod wal;
pub mod watch;
