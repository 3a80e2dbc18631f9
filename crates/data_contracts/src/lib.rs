//! Shared data contracts for Decathlon task manifests and BraTS label regions.

pub mod decathlon;
pub mod regions;

pub use decathlon::{ContractError, DecathlonManifest, DecathlonPair};
pub use regions::{BratsClass, BratsRegion, REGION_ORDER};
