//! [`KmsDevice`] on top of a `/dev/dri/card*` node.
//!
//! Object enumeration and property values go through the `drm` crate; property metadata,
//! framebuffers, blobs and vblank waits go straight to `drm-ffi`, which reports the raw
//! bitmasks and enum tables the planner works with.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use drm::control::atomic::AtomicModeReq;
use drm::control::{
    self, connector, crtc, encoder, plane, property, AtomicCommitFlags, Device as _,
    RawResourceHandle,
};
use drm::{ClientCapability, Device as _};
use tracing::{debug, trace};

use super::types::{
    BlobId, CommitFlags, ConnectionState, ConnectorId, ConnectorKind, CrtcId, EncoderId,
    EnumEntry, FramebufferId, ModeInfo, ObjectRef, PlaneId, PropertyId, PropertyInfo,
    PropertyKind, RawConnector, RawCrtc, RawEncoder, RawPlane, ResourceIds,
};
use super::{AtomicRequest, KmsDevice};
use crate::layer::BufferInfo;

const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
const DRM_MODE_PROP_BITMASK: u32 = 1 << 5;
const DRM_MODE_PROP_EXTENDED_TYPE: u32 = 0x0000_ffc0;
const DRM_MODE_PROP_OBJECT: u32 = 1 << 6;
const DRM_MODE_PROP_SIGNED_RANGE: u32 = 2 << 6;

const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

const DRM_VBLANK_RELATIVE: u32 = 0x1;
const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

/// An open DRM card with atomic mode-setting enabled.
#[derive(Debug)]
pub struct DrmCard {
    file: File,
    name: String,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl control::Device for DrmCard {}

impl DrmCard {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("DrmCard::open");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;
        let mut card = Self {
            file,
            name: String::new(),
        };

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context("error enabling universal planes")?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .context("device has no atomic mode-setting")?;
        if let Err(err) = card.set_client_capability(ClientCapability::WritebackConnectors, true) {
            debug!("{path:?}: no writeback connectors: {err}");
        }

        card.name = card
            .get_driver()
            .map(|driver| driver.name().to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.display().to_string());
        debug!("opened {path:?} ({})", card.name);

        Ok(card)
    }

    /// Bitmask of the CRTCs in `handles`, by their position in the resource list.
    fn crtc_mask(&self, handles: &[crtc::Handle]) -> io::Result<u32> {
        let res = self.resource_handles()?;
        Ok(handles
            .iter()
            .filter_map(|h| res.crtcs().iter().position(|c| c == h))
            .fold(0, |mask, pipe| mask | 1 << pipe))
    }

    fn property_info(&self, prop: property::Handle) -> io::Result<PropertyInfo> {
        let id = u32::from(prop);

        let mut values = Vec::new();
        let mut enums = Vec::new();
        let raw = drm_ffi::mode::get_property(
            self.as_fd(),
            id,
            Some(&mut values),
            Some(&mut enums),
        )?;

        let entries = || {
            enums
                .iter()
                .map(|e| EnumEntry {
                    name: c_name(&e.name),
                    value: e.value,
                })
                .collect()
        };
        let value = |i: usize| values.get(i).copied().unwrap_or(0);

        let flags = raw.flags;
        let kind = if flags & DRM_MODE_PROP_RANGE != 0 {
            PropertyKind::Range {
                min: value(0),
                max: value(1),
            }
        } else if flags & DRM_MODE_PROP_ENUM != 0 {
            PropertyKind::Enum(entries())
        } else if flags & DRM_MODE_PROP_BITMASK != 0 {
            PropertyKind::Bitmask(entries())
        } else if flags & DRM_MODE_PROP_BLOB != 0 {
            PropertyKind::Blob
        } else {
            match flags & DRM_MODE_PROP_EXTENDED_TYPE {
                DRM_MODE_PROP_SIGNED_RANGE => PropertyKind::SignedRange {
                    min: value(0) as i64,
                    max: value(1) as i64,
                },
                DRM_MODE_PROP_OBJECT => PropertyKind::Object,
                other => {
                    trace!("property {id} has unknown type {other:#x}");
                    PropertyKind::Object
                }
            }
        };

        Ok(PropertyInfo {
            id: PropertyId(id),
            name: c_name(&raw.name),
            kind,
            immutable: flags & DRM_MODE_PROP_IMMUTABLE != 0,
        })
    }
}

impl KmsDevice for DrmCard {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        let res = self.resource_handles()?;
        let planes = self.plane_handles()?;

        Ok(ResourceIds {
            crtcs: res.crtcs().iter().map(|&h| CrtcId(u32::from(h))).collect(),
            encoders: res.encoders().iter().map(|&h| EncoderId(u32::from(h))).collect(),
            connectors: res.connectors().iter().map(|&h| ConnectorId(u32::from(h))).collect(),
            planes: planes.iter().map(|&h| PlaneId(u32::from(h))).collect(),
            min_size: (
                bounds(res.supported_fb_width()).0,
                bounds(res.supported_fb_height()).0,
            ),
            max_size: (
                bounds(res.supported_fb_width()).1,
                bounds(res.supported_fb_height()).1,
            ),
        })
    }

    fn crtc(&self, id: CrtcId) -> io::Result<RawCrtc> {
        let info = self.get_crtc(handle(id.0)?)?;
        Ok(RawCrtc {
            id,
            mode: info.mode().map(mode_info),
        })
    }

    fn encoder(&self, id: EncoderId) -> io::Result<RawEncoder> {
        let raw = drm_ffi::mode::get_encoder(self.as_fd(), id.0)?;
        Ok(RawEncoder {
            id,
            crtc: (raw.crtc_id != 0).then_some(CrtcId(raw.crtc_id)),
            possible_crtcs: raw.possible_crtcs,
            possible_clones: raw.possible_clones,
        })
    }

    fn connector(&self, id: ConnectorId) -> io::Result<RawConnector> {
        let info = self.get_connector(handle::<connector::Handle>(id.0)?, true)?;

        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            connector::State::Unknown => ConnectionState::Unknown,
        };

        Ok(RawConnector {
            id,
            kind: ConnectorKind::from_raw(u32::from(info.interface())),
            kind_id: info.interface_id(),
            state,
            size_mm: info.size().unwrap_or((0, 0)),
            modes: info.modes().iter().copied().map(mode_info).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|&h: &encoder::Handle| EncoderId(u32::from(h)))
                .collect(),
            current_encoder: info.current_encoder().map(|h| EncoderId(u32::from(h))),
        })
    }

    fn plane(&self, id: PlaneId) -> io::Result<RawPlane> {
        let info = self.get_plane(handle::<plane::Handle>(id.0)?)?;
        let res = self.resource_handles()?;
        let possible = res.filter_crtcs(info.possible_crtcs());

        Ok(RawPlane {
            id,
            possible_crtcs: self.crtc_mask(&possible)?,
            formats: info.formats().to_vec(),
        })
    }

    fn properties(&self, object: ObjectRef) -> io::Result<Vec<(PropertyInfo, u64)>> {
        let props = match object {
            ObjectRef::Crtc(id) => self.get_properties(handle::<crtc::Handle>(id.0)?)?,
            ObjectRef::Connector(id) => self.get_properties(handle::<connector::Handle>(id.0)?)?,
            ObjectRef::Plane(id) => self.get_properties(handle::<plane::Handle>(id.0)?)?,
        };

        let (ids, values) = props.as_props_and_values();
        ids.iter()
            .zip(values)
            .map(|(&prop, &value)| Ok((self.property_info(prop)?, value)))
            .collect()
    }

    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> io::Result<()> {
        let _span = tracy_client::span!("DrmCard::atomic_commit");

        let mut atomic = AtomicModeReq::new();
        for write in req.writes() {
            let object: RawResourceHandle = handle(write.object.raw())?;
            let prop: property::Handle = handle(write.property.0)?;
            atomic.add_raw_property(object, prop, write.value);
        }

        let flags = AtomicCommitFlags::from_bits_truncate(flags.bits());
        control::Device::atomic_commit(self, flags, atomic)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
        Ok(BlobId(blob.blob_id))
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        self.destroy_property_blob(u64::from(blob.0))
    }

    fn add_framebuffer(&self, buffer: &BufferInfo) -> io::Result<FramebufferId> {
        let flags = if buffer.modifiers.iter().any(|&m| m != 0) {
            DRM_MODE_FB_MODIFIERS
        } else {
            0
        };

        let fb = drm_ffi::mode::add_fb2(
            self.as_fd(),
            buffer.width,
            buffer.height,
            buffer.format,
            &buffer.handles,
            &buffer.pitches,
            &buffer.offsets,
            &buffer.modifiers,
            flags,
        )?;
        Ok(FramebufferId(fb.fb_id))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        drm_ffi::mode::rm_fb(self.as_fd(), fb.0)
    }

    fn wait_vblank(&self, pipe: u32) -> io::Result<Duration> {
        let mut ty = DRM_VBLANK_RELATIVE;
        if pipe == 1 {
            ty |= DRM_VBLANK_SECONDARY;
        } else if pipe > 1 {
            ty |= (pipe << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK;
        }

        let reply = drm_ffi::wait_vblank(self.as_fd(), ty, 1, 0)?;
        Ok(Duration::new(reply.tval_sec as u64, 0) + Duration::from_micros(reply.tval_usec as u64))
    }
}

fn handle<T: From<RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero object id"))
}

fn bounds(range: impl RangeBounds<u32>) -> (u32, u32) {
    let min = match range.start_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let max = match range.end_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_sub(1),
        Bound::Unbounded => u32::MAX,
    };
    (min, max)
}

fn c_name(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn mode_info(mode: control::Mode) -> ModeInfo {
    let raw = drm_ffi::drm_mode_modeinfo::from(mode);

    ModeInfo {
        name: c_name(&raw.name),
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: raw.flags,
        mode_type: raw.type_,
    }
}
