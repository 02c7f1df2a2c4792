//! # Exemplar
//!
//! A byte-buffer test case generation and shrinking engine.
//!
//! Test cases are byte buffers. A test function reads structured values out of
//! a [`ConjectureData`] recorder; the [`ConjectureRunner`] searches the buffer
//! space for failures, deduplicates them by origin, and shrinks each failure
//! to a shortlex-minimal buffer that still fails the same way. Minimal
//! failures persist in an [`ExampleDatabase`] so later runs replay them first.

pub mod data;
pub mod database;
pub mod datatree;
pub mod engine;
pub mod shrinking;

pub use data::{
    ConjectureData, ConjectureResult, DataObserver, Span, Status, StopTest,
};
pub use database::{
    DatabaseError, DatabaseKey, DirectoryDatabase, ExampleDatabase, InMemoryDatabase,
};
pub use datatree::{DataTree, Transition, TreeRecordingObserver};
pub use engine::{
    ConjectureRunner, EngineError, ExitReason, HealthCheck, Phase, RunnerConfig, RunnerStats,
};
pub use shrinking::{sort_key, Minimizer};
