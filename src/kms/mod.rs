//! Kernel mode-setting device interface.
//!
//! The planner never talks to `/dev/dri` directly. Everything it needs from the kernel goes
//! through [`KmsDevice`]:
//! - `virt` - an in-memory device described by JSON, used for simulation and tests
//! - `drm` - the real thing, on top of the `drm` crate (feature `drm-backend`)

mod blob;
#[cfg(feature = "drm-backend")]
pub mod drm;
pub mod property;
pub mod types;
pub mod virt;

use std::io;
use std::time::Duration;

pub use blob::PropertyBlob;
pub use property::{AtomicRequest, EnumMap, Property, PropertyError, PropertyTable, PropertyWrite};
pub use types::{
    BlobId, CommitFlags, ConnectionState, ConnectorId, ConnectorKind, CrtcId, EncoderId,
    FramebufferId, ModeInfo, ObjectRef, PlaneId, PlaneType, PropertyId, PropertyInfo,
    PropertyKind, RawConnector, RawCrtc, RawEncoder, RawPlane, ResourceIds,
};

use crate::layer::BufferInfo;

/// Everything the planner needs from a KMS device.
///
/// Methods map one-to-one onto mode-setting ioctls and report failures as [`io::Error`], like
/// the kernel does.
pub trait KmsDevice: Send + Sync {
    /// Driver name, for logging.
    fn name(&self) -> String;

    fn resources(&self) -> io::Result<ResourceIds>;
    fn crtc(&self, id: CrtcId) -> io::Result<RawCrtc>;
    fn encoder(&self, id: EncoderId) -> io::Result<RawEncoder>;
    fn connector(&self, id: ConnectorId) -> io::Result<RawConnector>;
    fn plane(&self, id: PlaneId) -> io::Result<RawPlane>;

    /// Every property of `object` together with its current value.
    fn properties(&self, object: ObjectRef) -> io::Result<Vec<(PropertyInfo, u64)>>;

    /// Submit every staged write as one kernel transaction.
    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> io::Result<()>;

    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId>;
    fn destroy_blob(&self, blob: BlobId) -> io::Result<()>;

    fn add_framebuffer(&self, buffer: &BufferInfo) -> io::Result<FramebufferId>;
    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()>;

    /// Block until the next vertical blank on the CRTC with the given pipe index.
    ///
    /// Returns the vblank timestamp on the monotonic clock.
    fn wait_vblank(&self, pipe: u32) -> io::Result<Duration>;

    /// Create a MODE_ID blob for `mode`.
    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<BlobId> {
        self.create_blob(&mode.to_kernel_bytes())
    }
}
