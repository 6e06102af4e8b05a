//! Reconciles declarative manifests from versioned sources onto a fleet of
//! Kubernetes clusters.

pub mod application;
pub mod cluster;
pub mod config;
pub mod diff;
pub mod error;
pub mod kubernetes;
pub mod manifest;
pub mod reconciler;
pub mod reconciliation;
pub mod registry;
pub mod source;
pub mod state;

pub use application::{Application, ClusterTarget, Destination, SourceRef, SyncPolicy};
pub use config::FleetConfig;
pub use error::{Error, RegistryError, SyncError};
pub use reconciliation::Controller;
pub use state::{SyncPhase, SyncState};
