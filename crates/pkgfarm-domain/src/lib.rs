#![deny(clippy::all, warnings)]

//! Catalog model and incremental build planning.
//!
//! This crate is pure: it never touches the filesystem, the network, or the
//! sandbox. The orchestration crate feeds it catalog details plus a snapshot
//! of the artifact store and gets back an ordered build plan.

pub mod catalog;
pub mod plan;

pub use catalog::{Dependency, PackageDetails, PackageMap};
pub use plan::{plan_builds, BuildPlan, PlanItem, StoreSnapshot};
