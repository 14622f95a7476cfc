//! Hardware plane planning and atomic commits for KMS display pipelines.
//!
//! The crate takes per-display layer lists, decides which layers each hardware plane scans out
//! and which the client composites, and encodes the result into one atomic commit per device.

pub mod compositor;
pub mod kms;
pub mod layer;
pub mod plane;
pub mod resources;
pub mod scene;
pub mod utils;
pub mod vsync;
