//! Per-frame layers handed in by the display server.

pub mod format;
mod import;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use import::FbImporter;

use crate::kms::FramebufferId;

/// Fully opaque plane alpha.
pub const ALPHA_OPAQUE: u16 = 0xffff;

// =============================================================================
// Geometry
// =============================================================================

/// Integer rectangle in display coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> u64 {
        if self.is_degenerate() {
            0
        } else {
            self.width() as u64 * self.height() as u64
        }
    }

    /// Zero or negative area.
    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// Sub-pixel source rectangle in buffer coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.top.is_finite() && self.right.is_finite() && self.bottom.is_finite()
    }

    pub fn is_degenerate(&self) -> bool {
        !self.is_finite() || self.width() <= 0. || self.height() <= 0.
    }
}

impl From<Rect> for RectF {
    fn from(r: Rect) -> Self {
        Self::new(r.left as f32, r.top as f32, r.right as f32, r.bottom as f32)
    }
}

// =============================================================================
// Layer Attributes
// =============================================================================

bitflags! {
    /// Buffer transform. Flips apply before the rotation; the empty set is the identity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Transform: u32 {
        const FLIP_H = 1 << 0;
        const FLIP_V = 1 << 1;
        const ROTATE_90 = 1 << 2;
        const ROTATE_180 = 1 << 3;
        const ROTATE_270 = 1 << 4;
    }
}

const DRM_MODE_ROTATE_0: u64 = 1 << 0;
const DRM_MODE_ROTATE_90: u64 = 1 << 1;
const DRM_MODE_ROTATE_180: u64 = 1 << 2;
const DRM_MODE_ROTATE_270: u64 = 1 << 3;
const DRM_MODE_REFLECT_X: u64 = 1 << 4;
const DRM_MODE_REFLECT_Y: u64 = 1 << 5;

impl Transform {
    pub const IDENTITY: Self = Self::empty();

    pub fn is_identity(self) -> bool {
        self.is_empty()
    }

    /// Whether width and height trade places.
    pub fn swaps_axes(self) -> bool {
        self.intersects(Self::ROTATE_90 | Self::ROTATE_270)
    }

    /// Value for the plane `rotation` bitmask property.
    pub fn to_kms_rotation(self) -> u64 {
        let mut rotation = 0;
        if self.contains(Self::FLIP_H) {
            rotation |= DRM_MODE_REFLECT_X;
        }
        if self.contains(Self::FLIP_V) {
            rotation |= DRM_MODE_REFLECT_Y;
        }
        if self.contains(Self::ROTATE_90) {
            rotation |= DRM_MODE_ROTATE_90;
        } else if self.contains(Self::ROTATE_180) {
            rotation |= DRM_MODE_ROTATE_180;
        } else if self.contains(Self::ROTATE_270) {
            rotation |= DRM_MODE_ROTATE_270;
        } else {
            rotation |= DRM_MODE_ROTATE_0;
        }
        rotation
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Blending {
    #[default]
    None,
    PreMult,
    Coverage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorSpace {
    #[default]
    Undefined,
    Rec601,
    Rec709,
    Rec2020,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleRange {
    #[default]
    Undefined,
    Full,
    Limited,
}

/// Acquire fence of a buffer. Shared so that layers stay cheap to clone.
#[derive(Debug, Clone)]
pub struct Fence(Arc<OwnedFd>);

impl Fence {
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Buffer metadata needed to create a KMS framebuffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    /// Identity of the graphics buffer on the display-server side. Framebuffers are cached
    /// per id.
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    #[serde(default)]
    pub pitches: [u32; 4],
    #[serde(default)]
    pub offsets: [u32; 4],
    /// GEM handles per plane.
    #[serde(default)]
    pub handles: [u32; 4],
    #[serde(default)]
    pub modifiers: [u64; 4],
}

// =============================================================================
// Layer
// =============================================================================

/// One layer of a frame.
#[derive(Debug, Clone)]
pub struct Layer {
    pub buffer: Option<BufferInfo>,
    /// Framebuffer the buffer was imported as, once imported.
    pub fb: Option<FramebufferId>,
    pub source_crop: RectF,
    pub display_frame: Rect,
    pub z_order: u32,
    pub transform: Transform,
    pub blending: Blending,
    pub alpha: u16,
    pub color_space: ColorSpace,
    pub sample_range: SampleRange,
    pub acquire_fence: Option<Fence>,
    /// Content that must never be composited by the client.
    pub protected: bool,
}

impl Layer {
    /// A layer showing the whole buffer at `display_frame`, opaque and untransformed.
    pub fn new(buffer: BufferInfo, display_frame: Rect) -> Self {
        let source_crop = RectF::new(0., 0., buffer.width as f32, buffer.height as f32);
        Self {
            buffer: Some(buffer),
            fb: None,
            source_crop,
            display_frame,
            z_order: 0,
            transform: Transform::IDENTITY,
            blending: Blending::None,
            alpha: ALPHA_OPAQUE,
            color_space: ColorSpace::Undefined,
            sample_range: SampleRange::Undefined,
            acquire_fence: None,
            protected: false,
        }
    }

    pub fn format(&self) -> Option<u32> {
        self.buffer.as_ref().map(|b| b.format)
    }

    pub fn is_opaque(&self) -> bool {
        self.alpha == ALPHA_OPAQUE
    }

    /// Both rectangles have a non-zero area.
    pub fn has_valid_geometry(&self) -> bool {
        !self.display_frame.is_degenerate() && !self.source_crop.is_degenerate()
    }

    /// Whether the source crop has a different size than the display frame, after rotation.
    pub fn needs_scaling(&self) -> bool {
        let (src_w, src_h) = if self.transform.swaps_axes() {
            (self.source_crop.height(), self.source_crop.width())
        } else {
            (self.source_crop.width(), self.source_crop.height())
        };

        src_w.round() as i32 != self.display_frame.width()
            || src_h.round() as i32 != self.display_frame.height()
    }

    /// Whether any plane could show this layer at all, independent of plane capabilities.
    pub fn is_plane_eligible(&self, scale_with_gpu: bool) -> bool {
        self.fb.is_some()
            && self.has_valid_geometry()
            && !(scale_with_gpu && self.needs_scaling())
    }

    /// Import the buffer as a framebuffer, reusing an earlier import of the same buffer.
    pub fn import_buffer(
        &mut self,
        importer: &mut FbImporter,
    ) -> io::Result<FramebufferId> {
        let Some(buffer) = &self.buffer else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "layer has no buffer"));
        };

        let fb = importer.get_or_create(buffer)?;
        self.fb = Some(fb);
        Ok(fb)
    }
}
