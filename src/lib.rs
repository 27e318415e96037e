//! Offline-first request cache and durable mutation sync engine.
//!
//! [`engine::Engine`] wires the pieces together: a [`queue::DurableQueue`] of
//! pending mutations, a [`cache::ResourceCache`] answering requests under
//! per-class policies, and a [`sync::SyncOrchestrator`] draining the queue
//! whenever connectivity allows.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod queue;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;
