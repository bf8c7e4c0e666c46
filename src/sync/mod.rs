//! Durable-state side of the engine: file writes, version history, and the
//! orchestrator that pushes durable state back into a sandbox.

pub mod files;
pub mod orchestrator;
pub mod versions;

pub use files::{
    check_mass_overwrite, check_partial_content, FileSync, MergeMetadata, MergeOutcome,
    ReplaceOutcome, WriteSource,
};
pub use orchestrator::{OrchestratorSettings, OwnerSync, SyncOrchestrator, SyncReport};
pub use versions::{clamp_page, RestoreOutcome, VersionHistory};
