pub mod config;
pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod server;
pub mod storage;
pub mod store;
