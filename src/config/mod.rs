//! # Configuration
//!
//! Centralizes the engine's numeric constants and the persisted options
//! tree. Constants that depend on each other live together in
//! [`constants`] with their relationships documented; tunables that an
//! operator may change per deployment live in [`options`] and persist as
//! JSON next to the data directory.

pub mod constants;
pub mod options;

pub use constants::*;
pub use options::{
    EngineOptions, KeepVolatilePolicy, LogOptions, MemoryOptions, SnapshotOptions, XctOptions,
};
