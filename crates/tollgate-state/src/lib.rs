//! Tollgate-State: trajectory persistence
//!
//! Everything the governance layer writes lives behind [`TrajectoryStore`]:
//! registered agents, trajectory headers and their append-only steps.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: contiguous step sequencing, atomic appends, stable paging.
//!
//! ## Backends
//!
//! - `MemoryTrajectoryStore`: process-local, for tests and embedding
//! - `SurrealTrajectoryStore`: SurrealDB (`mem://`, `surrealkv://`, `ws(s)://`)
//! - `EphemeralTrajectoryStore`: keeps headers only; history reads fail with
//!   `StorageError::HistoryUnavailable`

pub mod config;
pub mod ephemeral;
mod error;
pub mod memory;
mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use config::StoreConfig;
pub use ephemeral::EphemeralTrajectoryStore;
pub use error::{StateError, StorageError};
pub use memory::MemoryTrajectoryStore;
pub use model::{
    Agent, Content, Decision, Disposition, Parameter, PolicyMetadata, PolicyMode, Role,
    SourceCode, Stage, Step, Tool, Trajectory, TrajectoryHeader, TrajectoryId, TrajectoryStatus,
    UnknownVariant,
};
pub use storage_traits::{
    Page, PageCursor, StorageResult, TrajectoryFilter, TrajectoryStore,
};
pub use surreal_store::SurrealTrajectoryStore;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
