//! tierio Placement - choosing the workers that host a new block
//!
//! A client holds a [`ClusterView`] snapshot of the workers it knows about
//! and asks a [`LocationPolicy`] for an ordered list of targets. The first
//! worker in the list is the primary replica.
//!
//! # Example
//! ```ignore
//! use tierio_placement::{LocationPolicy, PlacementRequest};
//!
//! let policy = LocationPolicy::new(LocationPolicyKind::MostAvailable);
//! let targets = policy.choose(view.active_workers(), &PlacementRequest::new(block_id, size, 3));
//! ```

pub mod policy;
pub mod topology;

pub use policy::{LocationPolicy, PlacementEngine, PlacementRequest};
pub use topology::{ClusterView, WorkerInfo, WorkerStatus};
