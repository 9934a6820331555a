//! Control-plane client for the storage-redirect daemon.

pub mod channel;
pub mod codec;
pub mod demo;
pub mod engine;
pub mod error;
pub mod host;
pub mod logs;
pub mod model;
pub mod queue;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;
