pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod messaging;
pub mod store;
