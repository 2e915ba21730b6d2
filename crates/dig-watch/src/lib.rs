pub mod config;
pub mod logging;
pub mod pull;
pub mod push;
pub mod reconciler;
pub mod session;
