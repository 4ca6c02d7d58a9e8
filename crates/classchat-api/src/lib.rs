pub mod auth;
pub mod conversations;
pub mod middleware;
