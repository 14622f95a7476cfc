//! Hardware plane capabilities and per-plane atomic state.
//!
//! A [`Plane`] is resolved once from its property table. Afterwards it answers whether a layer
//! can be scanned out on it and stages the writes that put a layer on it, or take it off.

use thiserror::Error;
use tracing::{trace, warn};

use crate::kms::{
    AtomicRequest, CrtcId, EnumMap, FramebufferId, KmsDevice, ObjectRef, PlaneId, PlaneType,
    Property, PropertyError, PropertyTable, RawPlane,
};
use crate::layer::{format, Blending, ColorSpace, Layer, SampleRange, Transform, ALPHA_OPAQUE};
use crate::resources::Crtc;

#[derive(Debug, Error)]
pub enum PlaneError {
    #[error("{plane} has invalid type {value}")]
    InvalidType { plane: PlaneId, value: u64 },
    #[error("layer has no framebuffer to show on {plane}")]
    NoFramebuffer { plane: PlaneId },
    #[error("{plane} has no {name} property")]
    Unsupported { plane: PlaneId, name: &'static str },
    #[error(transparent)]
    Property(#[from] PropertyError),
}

const ROTATIONS: [(&str, Transform); 6] = [
    ("rotate-0", Transform::IDENTITY),
    ("rotate-90", Transform::ROTATE_90),
    ("rotate-180", Transform::ROTATE_180),
    ("rotate-270", Transform::ROTATE_270),
    ("reflect-x", Transform::FLIP_H),
    ("reflect-y", Transform::FLIP_V),
];

const BLEND_MODES: [(&str, Blending); 3] = [
    ("Pre-multiplied", Blending::PreMult),
    ("Coverage", Blending::Coverage),
    ("None", Blending::None),
];

const COLOR_ENCODINGS: [(&str, ColorSpace); 3] = [
    ("ITU-R BT.709 YCbCr", ColorSpace::Rec709),
    ("ITU-R BT.601 YCbCr", ColorSpace::Rec601),
    ("ITU-R BT.2020 YCbCr", ColorSpace::Rec2020),
];

const COLOR_RANGES: [(&str, SampleRange); 2] = [
    ("YCbCr full range", SampleRange::Full),
    ("YCbCr limited range", SampleRange::Limited),
];

/// Convert a source coordinate to 16.16 fixed point.
fn to_fixed(v: f32) -> u64 {
    (f64::from(v.max(0.)) * 65536.) as u64
}

/// One hardware compositing plane.
#[derive(Debug, Clone)]
pub struct Plane {
    id: PlaneId,
    ty: PlaneType,
    possible_crtcs: u32,
    formats: Vec<u32>,

    crtc_id: Property,
    fb_id: Property,
    crtc_x: Property,
    crtc_y: Property,
    crtc_w: Property,
    crtc_h: Property,
    src_x: Property,
    src_y: Property,
    src_w: Property,
    src_h: Property,

    zpos: Option<Property>,
    rotation: Option<Property>,
    rotations: EnumMap<Transform>,
    alpha: Option<Property>,
    blend: Option<Property>,
    blend_modes: EnumMap<Blending>,
    in_fence_fd: Option<Property>,
    color_encoding: Option<Property>,
    color_encodings: EnumMap<ColorSpace>,
    color_range: Option<Property>,
    color_ranges: EnumMap<SampleRange>,
}

impl Plane {
    pub fn new(device: &dyn KmsDevice, raw: RawPlane) -> Result<Self, PlaneError> {
        let _span = tracy_client::span!("Plane::new");

        let table = PropertyTable::load(device, ObjectRef::Plane(raw.id))?;
        Self::from_table(raw, &table)
    }

    pub fn from_table(raw: RawPlane, table: &PropertyTable) -> Result<Self, PlaneError> {
        let type_prop = table.mandatory("type")?;
        let ty = PlaneType::from_raw(type_prop.value()).ok_or(PlaneError::InvalidType {
            plane: raw.id,
            value: type_prop.value(),
        })?;

        let zpos = table.optional("zpos");
        if zpos.is_none() {
            warn!("{} has no zpos property", raw.id);
        }

        let rotation = table.optional("rotation");
        let rotations = rotation
            .as_ref()
            .map(|p| p.enum_map(&ROTATIONS))
            .unwrap_or_default();

        let blend = table.optional("pixel blend mode");
        let blend_modes = blend
            .as_ref()
            .map(|p| p.enum_map(&BLEND_MODES))
            .unwrap_or_default();

        // Color encoding only matters for YCbCr scanout.
        let has_yuv = raw.formats.iter().any(|&f| !format::is_rgb(f));
        let (color_encoding, color_encodings) = match has_yuv {
            true => {
                let prop = table.optional("COLOR_ENCODING");
                let map = prop
                    .as_ref()
                    .map(|p| p.enum_map(&COLOR_ENCODINGS))
                    .unwrap_or_default();
                (prop, map)
            }
            false => (None, EnumMap::default()),
        };
        let (color_range, color_ranges) = match has_yuv {
            true => {
                let prop = table.optional("COLOR_RANGE");
                let map = prop
                    .as_ref()
                    .map(|p| p.enum_map(&COLOR_RANGES))
                    .unwrap_or_default();
                (prop, map)
            }
            false => (None, EnumMap::default()),
        };

        let plane = Self {
            id: raw.id,
            ty,
            possible_crtcs: raw.possible_crtcs,
            formats: raw.formats,
            crtc_id: table.mandatory("CRTC_ID")?,
            fb_id: table.mandatory("FB_ID")?,
            crtc_x: table.mandatory("CRTC_X")?,
            crtc_y: table.mandatory("CRTC_Y")?,
            crtc_w: table.mandatory("CRTC_W")?,
            crtc_h: table.mandatory("CRTC_H")?,
            src_x: table.mandatory("SRC_X")?,
            src_y: table.mandatory("SRC_Y")?,
            src_w: table.mandatory("SRC_W")?,
            src_h: table.mandatory("SRC_H")?,
            zpos,
            rotation,
            rotations,
            alpha: table.optional("alpha"),
            blend,
            blend_modes,
            in_fence_fd: table.optional("IN_FENCE_FD"),
            color_encoding,
            color_encodings,
            color_range,
            color_ranges,
        };

        trace!(
            "{}: {:?}, {} formats, crtcs {:#b}",
            plane.id,
            plane.ty,
            plane.formats.len(),
            plane.possible_crtcs
        );

        Ok(plane)
    }

    // === Core Accessors ===

    pub fn id(&self) -> PlaneId {
        self.id
    }

    pub fn ty(&self) -> PlaneType {
        self.ty
    }

    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    /// Get the lowest zpos the driver accepts, if zpos is settable.
    pub fn zpos_min(&self) -> Option<u64> {
        self.zpos
            .as_ref()
            .filter(|p| !p.is_immutable())
            .map(|p| p.range_min().unwrap_or(0))
    }

    pub fn supports_format(&self, format: u32) -> bool {
        self.formats.contains(&format)
    }

    /// Whether this plane can be attached to `crtc`.
    pub fn supports_crtc(&self, crtc: &Crtc) -> bool {
        1u32.checked_shl(crtc.pipe())
            .is_some_and(|bit| self.possible_crtcs & bit != 0)
    }

    // === Capability Checks ===

    /// Whether `layer` can be scanned out on this plane as it is.
    pub fn is_valid_for_layer(&self, layer: &Layer) -> bool {
        if !layer.transform.is_identity()
            && (self.rotation.is_none() || !self.rotations.contains(&layer.transform))
        {
            trace!("{} cannot apply transform {:?}", self.id, layer.transform);
            return false;
        }

        if self.alpha.is_none() && layer.alpha != ALPHA_OPAQUE {
            trace!("{} has no alpha property", self.id);
            return false;
        }

        if !matches!(layer.blending, Blending::None | Blending::PreMult)
            && !self.blend_modes.contains(&layer.blending)
        {
            trace!("{} cannot blend with {:?}", self.id, layer.blending);
            return false;
        }

        match layer.format() {
            Some(format) if self.supports_format(format) => true,
            Some(format) => {
                trace!(
                    "{} does not support format {}",
                    self.id,
                    format::fourcc_name(format)
                );
                false
            }
            None => false,
        }
    }

    // === Atomic State ===

    /// Stage the writes showing `layer` on this plane at `zpos`, attached to `crtc`.
    ///
    /// On error `req` is left untouched.
    pub fn atomic_set_state(
        &self,
        req: &mut AtomicRequest,
        layer: &Layer,
        zpos: u32,
        crtc: CrtcId,
    ) -> Result<(), PlaneError> {
        let fb = layer.fb.ok_or(PlaneError::NoFramebuffer { plane: self.id })?;
        self.stage(req, layer, fb, zpos, crtc)
    }

    fn stage(
        &self,
        req: &mut AtomicRequest,
        layer: &Layer,
        fb: FramebufferId,
        zpos: u32,
        crtc: CrtcId,
    ) -> Result<(), PlaneError> {
        let mut staged = AtomicRequest::new();

        let frame = layer.display_frame;
        let crop = layer.source_crop;

        self.crtc_id.atomic_set(&mut staged, u64::from(crtc.0))?;
        self.fb_id.atomic_set(&mut staged, u64::from(fb.0))?;
        self.crtc_x.atomic_set(&mut staged, i64::from(frame.left) as u64)?;
        self.crtc_y.atomic_set(&mut staged, i64::from(frame.top) as u64)?;
        self.crtc_w.atomic_set(&mut staged, frame.width() as u64)?;
        self.crtc_h.atomic_set(&mut staged, frame.height() as u64)?;
        self.src_x.atomic_set(&mut staged, to_fixed(crop.left))?;
        self.src_y.atomic_set(&mut staged, to_fixed(crop.top))?;
        self.src_w.atomic_set(&mut staged, to_fixed(crop.width()))?;
        self.src_h.atomic_set(&mut staged, to_fixed(crop.height()))?;

        if let Some(zpos_prop) = &self.zpos {
            if !zpos_prop.is_immutable() {
                let min = zpos_prop.range_min().unwrap_or(0);
                zpos_prop.atomic_set(&mut staged, u64::from(zpos) + min)?;
            }
        }

        if let Some(fence) = &layer.acquire_fence {
            let prop = self.in_fence_fd.as_ref().ok_or(PlaneError::Unsupported {
                plane: self.id,
                name: "IN_FENCE_FD",
            })?;
            prop.atomic_set(&mut staged, i64::from(fence.raw()) as u64)?;
        }

        if let Some(rotation) = &self.rotation {
            rotation.atomic_set(&mut staged, layer.transform.to_kms_rotation())?;
        }

        if let Some(alpha) = &self.alpha {
            alpha.atomic_set(&mut staged, u64::from(layer.alpha))?;
        }

        if let (Some(blend), Some(value)) = (&self.blend, self.blend_modes.get(&layer.blending)) {
            blend.atomic_set(&mut staged, value)?;
        }

        if let (Some(prop), Some(value)) = (
            &self.color_encoding,
            self.color_encodings.get(&layer.color_space),
        ) {
            prop.atomic_set(&mut staged, value)?;
        }

        if let (Some(prop), Some(value)) = (
            &self.color_range,
            self.color_ranges.get(&layer.sample_range),
        ) {
            prop.atomic_set(&mut staged, value)?;
        }

        req.merge(staged);
        Ok(())
    }

    /// Stage the writes detaching this plane. Never fails.
    pub fn atomic_disable(&self, req: &mut AtomicRequest) {
        let object = ObjectRef::Plane(self.id);
        req.add(object, self.crtc_id.id(), self.crtc_id.name(), 0);
        req.add(object, self.fb_id.id(), self.fb_id.name(), 0);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kms::virt::{HardwareDesc, PlaneDesc, VirtualDevice, ZposDesc};
    use crate::layer::{BufferInfo, Rect, RectF};
    use crate::resources::ResourceGraph;

    fn buffer(format: u32) -> BufferInfo {
        BufferInfo {
            id: 1,
            width: 256,
            height: 128,
            format,
            pitches: [1024, 0, 0, 0],
            offsets: [0; 4],
            handles: [1, 0, 0, 0],
            modifiers: [0; 4],
        }
    }

    fn layer(format: u32) -> Layer {
        let mut layer = Layer::new(buffer(format), Rect::new(10, 20, 266, 148));
        layer.fb = Some(FramebufferId(200));
        layer
    }

    fn device(plane: PlaneDesc) -> Arc<dyn KmsDevice> {
        Arc::new(VirtualDevice::new(HardwareDesc::single_display(vec![plane])))
    }

    fn plane(desc: PlaneDesc) -> (Plane, Crtc) {
        let device = device(desc);
        let graph = ResourceGraph::new(device, &[], 0).unwrap();
        let plane = graph.planes()[0].clone();
        let crtc = graph.crtcs()[0].clone();
        (plane, crtc)
    }

    fn bare_overlay() -> PlaneDesc {
        PlaneDesc {
            rotations: vec![],
            alpha: false,
            blend_modes: vec![],
            zpos: None,
            ..PlaneDesc::overlay(&["XR24"])
        }
    }

    #[test]
    fn transform_needs_exact_rotation_entry() {
        let (bare, _) = plane(bare_overlay());
        let (rotating, _) = plane(PlaneDesc {
            rotations: vec!["rotate-0".into(), "rotate-90".into(), "reflect-x".into()],
            ..bare_overlay()
        });

        let mut l = layer(format::XRGB8888);
        assert!(bare.is_valid_for_layer(&l));
        assert!(rotating.is_valid_for_layer(&l));

        l.transform = Transform::ROTATE_90;
        assert!(!bare.is_valid_for_layer(&l));
        assert!(rotating.is_valid_for_layer(&l));

        l.transform = Transform::ROTATE_180;
        assert!(!rotating.is_valid_for_layer(&l));

        // Compound transforms need their own entry.
        l.transform = Transform::FLIP_H | Transform::ROTATE_90;
        assert!(!rotating.is_valid_for_layer(&l));
    }

    #[test]
    fn alpha_and_blending_need_properties() {
        let (bare, _) = plane(bare_overlay());
        let (full, _) = plane(PlaneDesc::overlay(&["XR24"]));

        let mut l = layer(format::XRGB8888);
        l.alpha = 0x8000;
        assert!(!bare.is_valid_for_layer(&l));
        assert!(full.is_valid_for_layer(&l));

        let mut l = layer(format::XRGB8888);
        l.blending = Blending::PreMult;
        assert!(bare.is_valid_for_layer(&l));
        l.blending = Blending::Coverage;
        assert!(!bare.is_valid_for_layer(&l));
        assert!(full.is_valid_for_layer(&l));
    }

    #[test]
    fn format_must_be_listed() {
        let (p, _) = plane(bare_overlay());
        assert!(p.is_valid_for_layer(&layer(format::XRGB8888)));
        assert!(!p.is_valid_for_layer(&layer(format::NV12)));

        let mut no_buffer = layer(format::XRGB8888);
        no_buffer.buffer = None;
        assert!(!p.is_valid_for_layer(&no_buffer));
    }

    #[test]
    fn validity_is_deterministic() {
        let (p, _) = plane(PlaneDesc::overlay(&["XR24", "NV12"]));
        let mut l = layer(format::NV12);
        l.transform = Transform::ROTATE_270;
        l.alpha = 0x1234;
        let first = p.is_valid_for_layer(&l);
        assert_eq!(first, p.is_valid_for_layer(&l));
    }

    #[test]
    fn set_state_writes() {
        let (p, crtc) = plane(PlaneDesc {
            zpos: Some(ZposDesc {
                min: 2,
                max: 8,
                immutable: false,
            }),
            ..PlaneDesc::overlay(&["XR24"])
        });

        let mut l = layer(format::XRGB8888);
        l.source_crop = RectF::new(0.5, 0., 256., 128.);
        l.blending = Blending::Coverage;
        l.transform = Transform::FLIP_V;

        let mut req = AtomicRequest::new();
        p.atomic_set_state(&mut req, &l, 1, crtc.id()).unwrap();

        let values: Vec<_> = req.writes().iter().map(|w| (w.name.as_str(), w.value)).collect();
        assert_eq!(
            values,
            [
                ("CRTC_ID", u64::from(crtc.id().0)),
                ("FB_ID", 200),
                ("CRTC_X", 10),
                ("CRTC_Y", 20),
                ("CRTC_W", 256),
                ("CRTC_H", 128),
                ("SRC_X", 0x8000),
                ("SRC_Y", 0),
                ("SRC_W", (255 << 16) + 0x8000),
                ("SRC_H", 128 << 16),
                ("zpos", 3),
                ("rotation", (1 << 5) | 1),
                ("alpha", 0xffff),
                ("pixel blend mode", 1),
            ]
        );
    }

    #[test]
    fn immutable_zpos_is_not_written() {
        let (p, crtc) = plane(PlaneDesc {
            zpos: Some(ZposDesc {
                min: 0,
                max: 0,
                immutable: true,
            }),
            ..PlaneDesc::overlay(&["XR24"])
        });

        let mut req = AtomicRequest::new();
        p.atomic_set_state(&mut req, &layer(format::XRGB8888), 4, crtc.id())
            .unwrap();
        assert_eq!(req.value(ObjectRef::Plane(p.id()), "zpos"), None);
    }

    #[test]
    fn failed_state_leaves_request_untouched() {
        let (p, crtc) = plane(PlaneDesc {
            zpos: Some(ZposDesc {
                min: 0,
                max: 1,
                immutable: false,
            }),
            ..PlaneDesc::overlay(&["XR24"])
        });

        let mut req = AtomicRequest::new();
        p.atomic_disable(&mut req);
        let before = req.clone();

        // zpos 5 is out of range.
        let err = p
            .atomic_set_state(&mut req, &layer(format::XRGB8888), 5, crtc.id())
            .unwrap_err();
        assert!(matches!(
            err,
            PlaneError::Property(PropertyError::OutOfRange { .. })
        ));
        assert_eq!(req, before);

        let mut no_fb = layer(format::XRGB8888);
        no_fb.fb = None;
        assert!(matches!(
            p.atomic_set_state(&mut req, &no_fb, 0, crtc.id()),
            Err(PlaneError::NoFramebuffer { .. })
        ));
        assert_eq!(req, before);
    }

    #[test]
    fn color_encoding_for_yuv_planes_only() {
        let (rgb, crtc) = plane(PlaneDesc::overlay(&["XR24"]));
        let (yuv, _) = plane(PlaneDesc::overlay(&["XR24", "NV12"]));

        let mut l = layer(format::XRGB8888);
        l.color_space = ColorSpace::Rec709;
        l.sample_range = SampleRange::Limited;

        let mut req = AtomicRequest::new();
        rgb.atomic_set_state(&mut req, &l, 0, crtc.id()).unwrap();
        assert_eq!(req.value(ObjectRef::Plane(rgb.id()), "COLOR_ENCODING"), None);

        let mut req = AtomicRequest::new();
        yuv.atomic_set_state(&mut req, &l, 0, crtc.id()).unwrap();
        let obj = ObjectRef::Plane(yuv.id());
        assert_eq!(req.value(obj, "COLOR_ENCODING"), Some(1));
        assert_eq!(req.value(obj, "COLOR_RANGE"), Some(0));
    }

    #[test]
    fn disable_then_assign_matches_direct_assign() {
        let (p, crtc) = plane(PlaneDesc::overlay(&["XR24"]));
        let l = layer(format::XRGB8888);

        let mut direct = AtomicRequest::new();
        p.atomic_set_state(&mut direct, &l, 0, crtc.id()).unwrap();

        let mut disabled = AtomicRequest::new();
        p.atomic_disable(&mut disabled);
        assert_eq!(disabled.len(), 2);
        p.atomic_set_state(&mut disabled, &l, 0, crtc.id()).unwrap();

        assert_eq!(disabled, direct);
    }
}
