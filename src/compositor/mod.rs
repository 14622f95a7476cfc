//! Planning frames onto hardware planes.
//!
//! Each display has a [`DisplayPipeline`]. A frame is validated into a [`DisplayComposition`]
//! by a [`PlacementStrategy`], which decides what each plane shows, then encoded into one
//! atomic request per device and committed.

pub mod commit;
pub mod composition;
pub mod cycle;
pub mod display;
pub mod planner;
pub mod strategy;

pub use commit::{encode, CommitError, PendingCommit};
pub use composition::{
    CompositionError, CompositionKind, CompositionPlane, DisplayComposition, DpmsMode, PlaneRole,
    WritebackTarget,
};
pub use cycle::{commit_frame, DisplayFrame, DisplayReport, FrameError, FrameReport};
pub use display::{DisplayPipeline, FrameStats};
pub use planner::{can_scan_out, PlanOptions, PlanePool};
pub use strategy::{strategy_for, PlacementStrategy};
