pub mod client;
pub mod config;
pub mod emitter;
pub mod error;
pub mod event;
pub mod relay;
