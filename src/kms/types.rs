//! Type definitions for the kernel device interface.
//!
//! These mirror what the KMS ioctls report about CRTCs, encoders, connectors and planes, in a
//! form that does not depend on a particular DRM binding.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// =============================================================================
// Object Ids
// =============================================================================

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

object_id!(CrtcId, "crtc-");
object_id!(EncoderId, "encoder-");
object_id!(ConnectorId, "connector-");
object_id!(PlaneId, "plane-");
object_id!(PropertyId, "prop-");
object_id!(
    /// Framebuffer id as returned by ADDFB2. Zero is never a valid framebuffer.
    FramebufferId,
    "fb-"
);
object_id!(BlobId, "blob-");

/// A KMS object that carries properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    Crtc(CrtcId),
    Connector(ConnectorId),
    Plane(PlaneId),
}

impl ObjectRef {
    /// The raw object id, as used by the kernel.
    pub fn raw(self) -> u32 {
        match self {
            ObjectRef::Crtc(id) => id.0,
            ObjectRef::Connector(id) => id.0,
            ObjectRef::Plane(id) => id.0,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Crtc(id) => id.fmt(f),
            ObjectRef::Connector(id) => id.fmt(f),
            ObjectRef::Plane(id) => id.fmt(f),
        }
    }
}

// =============================================================================
// Constants
// =============================================================================

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_TYPE_USERDEF: u32 = 1 << 5;

pub const DRM_MODE_FLAG_PHSYNC: u32 = 1 << 0;
pub const DRM_MODE_FLAG_NHSYNC: u32 = 1 << 1;
pub const DRM_MODE_FLAG_PVSYNC: u32 = 1 << 2;
pub const DRM_MODE_FLAG_NVSYNC: u32 = 1 << 3;
pub const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;
pub const DRM_MODE_FLAG_DBLSCAN: u32 = 1 << 5;

/// Size of `struct drm_mode_modeinfo`.
pub const MODEINFO_SIZE: usize = 68;

bitflags! {
    /// Flags for an atomic commit.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x01;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Display timings, laid out like `struct drm_mode_modeinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeInfo {
    #[serde(default)]
    pub name: String,
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    #[serde(default)]
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    #[serde(default)]
    pub vscan: u16,
    pub vrefresh: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub mode_type: u32,
}

impl ModeInfo {
    /// Reduced-blanking style timings for the given size and refresh rate.
    ///
    /// Good enough for virtual outputs; real connectors report their own modes.
    pub fn synthetic(width: u16, height: u16, refresh: u32) -> Self {
        let hsync_start = width + 48;
        let hsync_end = hsync_start + 32;
        let htotal = hsync_end + 80;
        let vsync_start = height + 3;
        let vsync_end = vsync_start + 5;
        let vtotal = vsync_end + 23;

        let clock = (u64::from(htotal) * u64::from(vtotal) * u64::from(refresh) / 1000) as u32;

        Self {
            name: format!("{width}x{height}"),
            clock,
            hdisplay: width,
            hsync_start,
            hsync_end,
            htotal,
            hskew: 0,
            vdisplay: height,
            vsync_start,
            vsync_end,
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: DRM_MODE_FLAG_NHSYNC | DRM_MODE_FLAG_PVSYNC,
            mode_type: 0,
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type & DRM_MODE_TYPE_PREFERRED != 0
    }

    /// Whether both modes describe the same timings, ignoring the name and type.
    pub fn same_timings(&self, other: &ModeInfo) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.hskew == other.hskew
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.vscan == other.vscan
            && self.flags == other.flags
    }

    /// Calculate the refresh interval from the timings.
    pub fn refresh_interval(&self) -> Option<Duration> {
        let clock = u64::from(self.clock);
        let htotal = u64::from(self.htotal);
        let vtotal = u64::from(self.vtotal);

        if clock == 0 || htotal == 0 || vtotal == 0 {
            return None;
        }

        let mut numerator = htotal * vtotal * 1_000_000;
        let mut denominator = clock;

        if self.flags & DRM_MODE_FLAG_INTERLACE != 0 {
            denominator *= 2;
        }

        if self.flags & DRM_MODE_FLAG_DBLSCAN != 0 {
            numerator *= 2;
        }

        if self.vscan > 1 {
            numerator *= u64::from(self.vscan);
        }

        let refresh_interval = (numerator + denominator / 2) / denominator;
        Some(Duration::from_nanos(refresh_interval))
    }

    /// Serialize into the byte layout of `struct drm_mode_modeinfo`, for use as a MODE_ID blob.
    pub fn to_kernel_bytes(&self) -> [u8; MODEINFO_SIZE] {
        let mut out = [0u8; MODEINFO_SIZE];
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            out[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };

        put(&self.clock.to_ne_bytes());
        for v in [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ] {
            put(&v.to_ne_bytes());
        }
        put(&self.vrefresh.to_ne_bytes());
        put(&self.flags.to_ne_bytes());
        put(&self.mode_type.to_ne_bytes());

        // Max 31 chars + null terminator.
        let mut name = [0u8; 32];
        for (a, b) in name[..31].iter_mut().zip(self.name.as_bytes()) {
            *a = *b;
        }
        put(&name);

        out
    }
}

// =============================================================================
// Object Descriptions
// =============================================================================

/// Connector types, numbered like `DRM_MODE_CONNECTOR_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorKind {
    Unknown,
    #[serde(rename = "VGA")]
    Vga,
    #[serde(rename = "DVI-I")]
    DviI,
    #[serde(rename = "DVI-D")]
    DviD,
    #[serde(rename = "DVI-A")]
    DviA,
    Composite,
    #[serde(rename = "SVIDEO")]
    SVideo,
    #[serde(rename = "LVDS")]
    Lvds,
    Component,
    #[serde(rename = "DIN")]
    NinePinDin,
    #[serde(rename = "DP")]
    DisplayPort,
    #[serde(rename = "HDMI-A")]
    HdmiA,
    #[serde(rename = "HDMI-B")]
    HdmiB,
    #[serde(rename = "TV")]
    Tv,
    #[serde(rename = "eDP")]
    Edp,
    Virtual,
    #[serde(rename = "DSI")]
    Dsi,
    #[serde(rename = "DPI")]
    Dpi,
    Writeback,
    #[serde(rename = "SPI")]
    Spi,
    #[serde(rename = "USB")]
    Usb,
}

impl ConnectorKind {
    /// Map a `DRM_MODE_CONNECTOR_*` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Vga,
            2 => Self::DviI,
            3 => Self::DviD,
            4 => Self::DviA,
            5 => Self::Composite,
            6 => Self::SVideo,
            7 => Self::Lvds,
            8 => Self::Component,
            9 => Self::NinePinDin,
            10 => Self::DisplayPort,
            11 => Self::HdmiA,
            12 => Self::HdmiB,
            13 => Self::Tv,
            14 => Self::Edp,
            15 => Self::Virtual,
            16 => Self::Dsi,
            17 => Self::Dpi,
            18 => Self::Writeback,
            19 => Self::Spi,
            20 => Self::Usb,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "None",
            Self::Vga => "VGA",
            Self::DviI => "DVI-I",
            Self::DviD => "DVI-D",
            Self::DviA => "DVI-A",
            Self::Composite => "Composite",
            Self::SVideo => "SVIDEO",
            Self::Lvds => "LVDS",
            Self::Component => "Component",
            Self::NinePinDin => "DIN",
            Self::DisplayPort => "DP",
            Self::HdmiA => "HDMI-A",
            Self::HdmiB => "HDMI-B",
            Self::Tv => "TV",
            Self::Edp => "eDP",
            Self::Virtual => "Virtual",
            Self::Dsi => "DSI",
            Self::Dpi => "DPI",
            Self::Writeback => "Writeback",
            Self::Spi => "SPI",
            Self::Usb => "USB",
        }
    }

    /// Built-in panels, preferred as the primary display.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            Self::Lvds | Self::Edp | Self::Dsi | Self::Virtual | Self::Dpi
        )
    }

    pub fn is_external(self) -> bool {
        matches!(
            self,
            Self::HdmiA | Self::DisplayPort | Self::DviD | Self::DviI | Self::Vga
        )
    }

    pub fn is_writeback(self) -> bool {
        self == Self::Writeback
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// Plane types, numbered like `DRM_PLANE_TYPE_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaneType {
    Overlay = 0,
    Primary = 1,
    Cursor = 2,
}

impl PlaneType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Overlay),
            1 => Some(Self::Primary),
            2 => Some(Self::Cursor),
            _ => None,
        }
    }
}

/// Handles of every mode-setting object on a device.
#[derive(Debug, Clone, Default)]
pub struct ResourceIds {
    pub crtcs: Vec<CrtcId>,
    pub encoders: Vec<EncoderId>,
    pub connectors: Vec<ConnectorId>,
    pub planes: Vec<PlaneId>,
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct RawCrtc {
    pub id: CrtcId,
    pub mode: Option<ModeInfo>,
}

#[derive(Debug, Clone)]
pub struct RawEncoder {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    /// Bit `n` set means the CRTC with pipe index `n` can drive this encoder.
    pub possible_crtcs: u32,
    /// Bit `n` set means the encoder at index `n` can be cloned with this one.
    pub possible_clones: u32,
}

#[derive(Debug, Clone)]
pub struct RawConnector {
    pub id: ConnectorId,
    pub kind: ConnectorKind,
    pub kind_id: u32,
    pub state: ConnectionState,
    pub size_mm: (u32, u32),
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<EncoderId>,
    pub current_encoder: Option<EncoderId>,
}

#[derive(Debug, Clone)]
pub struct RawPlane {
    pub id: PlaneId,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumEntry {
    pub name: String,
    /// For enum properties the value itself, for bitmask properties the bit index.
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum(Vec<EnumEntry>),
    Bitmask(Vec<EnumEntry>),
    Blob,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub name: String,
    pub kind: PropertyKind,
    pub immutable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_interval_of_synthetic_mode() {
        let mode = ModeInfo::synthetic(1920, 1080, 60);
        let interval = mode.refresh_interval().unwrap();
        let hz = 1_000_000_000.0 / interval.as_nanos() as f64;
        assert!((hz - 60.0).abs() < 0.1, "{hz}");
    }

    #[test]
    fn interlaced_halves_interval() {
        let mode = ModeInfo::synthetic(1920, 1080, 60);
        let mut interlaced = mode.clone();
        interlaced.flags |= DRM_MODE_FLAG_INTERLACE;

        let a = mode.refresh_interval().unwrap().as_nanos();
        let b = interlaced.refresh_interval().unwrap().as_nanos();
        assert!(b.abs_diff(a / 2) <= 1);
    }

    #[test]
    fn kernel_bytes_layout() {
        let mode = ModeInfo::synthetic(800, 600, 60);
        let bytes = mode.to_kernel_bytes();

        assert_eq!(&bytes[0..4], &mode.clock.to_ne_bytes());
        assert_eq!(&bytes[4..6], &800u16.to_ne_bytes());
        assert_eq!(&bytes[14..16], &600u16.to_ne_bytes());
        assert_eq!(&bytes[24..28], &60u32.to_ne_bytes());
        assert_eq!(&bytes[36..43], b"800x600");
        assert_eq!(bytes[43], 0);
    }

    #[test]
    fn connector_kind_names() {
        assert_eq!(ConnectorKind::from_raw(14).as_str(), "eDP");
        assert_eq!(ConnectorKind::from_raw(11).as_str(), "HDMI-A");
        assert!(ConnectorKind::Dsi.is_internal());
        assert!(ConnectorKind::Vga.is_external());
        assert!(!ConnectorKind::Writeback.is_internal());
        assert!(!ConnectorKind::Writeback.is_external());
        assert_eq!(ConnectorKind::from_raw(99), ConnectorKind::Unknown);
    }
}
