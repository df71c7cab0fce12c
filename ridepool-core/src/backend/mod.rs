// File: ridepool-core/src/backend/mod.rs

pub mod memory;

pub use memory::InMemoryBackend;
