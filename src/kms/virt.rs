//! In-memory KMS device.
//!
//! A [`VirtualDevice`] is built from a [`HardwareDesc`], usually read from JSON. It advertises
//! the same properties a typical atomic driver does, validates and records every commit, and
//! keeps track of blobs and framebuffers. It never produces vblank events, so timing falls back
//! to synthetic vsync.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::types::{
    BlobId, CommitFlags, ConnectionState, ConnectorId, ConnectorKind, CrtcId, EncoderId,
    EnumEntry, FramebufferId, ModeInfo, ObjectRef, PlaneId, PlaneType, PropertyId, PropertyInfo,
    PropertyKind, RawConnector, RawCrtc, RawEncoder, RawPlane, ResourceIds,
    DRM_MODE_TYPE_PREFERRED,
};
use super::{AtomicRequest, KmsDevice};
use crate::layer::{format, BufferInfo};

// =============================================================================
// Hardware Description
// =============================================================================

/// Layout of a virtual device.
///
/// Objects refer to each other by their position in the lists: CRTCs by pipe index, encoders
/// by encoder index.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareDesc {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub crtcs: Vec<CrtcDesc>,
    pub encoders: Vec<EncoderDesc>,
    pub connectors: Vec<ConnectorDesc>,
    pub planes: Vec<PlaneDesc>,
    /// Fail every non-test commit, like a driver running out of bandwidth.
    #[serde(default)]
    pub reject_commits: bool,
    /// Fail any commit, test-only ones included, that would leave more planes scanning out.
    #[serde(default)]
    pub max_active_planes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrtcDesc {
    /// Mode the CRTC is currently scanning out, if any.
    #[serde(default)]
    pub mode: Option<ModeDesc>,
    /// Number of gamma LUT entries; zero means no gamma support.
    #[serde(default = "default_gamma_size")]
    pub gamma_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderDesc {
    pub possible_crtcs: Vec<u32>,
    #[serde(default)]
    pub possible_clones: Vec<u32>,
    /// Pipe index of the CRTC currently driving the encoder.
    #[serde(default)]
    pub crtc: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorDesc {
    pub kind: ConnectorKind,
    #[serde(default = "default_kind_id")]
    pub kind_id: u32,
    #[serde(default = "default_state")]
    pub state: ConnectionState,
    #[serde(default)]
    pub modes: Vec<ModeDesc>,
    pub encoders: Vec<u32>,
    /// Index of the encoder currently bound to the connector.
    #[serde(default)]
    pub encoder: Option<u32>,
    #[serde(default)]
    pub size_mm: (u32, u32),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeDesc {
    pub width: u16,
    pub height: u16,
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    #[serde(default)]
    pub preferred: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaneDesc {
    #[serde(rename = "type")]
    pub ty: PlaneType,
    #[serde(default = "default_possible_crtcs")]
    pub possible_crtcs: Vec<u32>,
    /// Fourcc codes, e.g. `"XR24"`.
    pub formats: Vec<String>,
    #[serde(default)]
    pub zpos: Option<ZposDesc>,
    #[serde(default = "default_rotations")]
    pub rotations: Vec<String>,
    #[serde(default = "default_true")]
    pub alpha: bool,
    #[serde(default = "default_blend_modes")]
    pub blend_modes: Vec<String>,
    #[serde(default = "default_true")]
    pub in_fence: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZposDesc {
    pub min: u64,
    pub max: u64,
    #[serde(default)]
    pub immutable: bool,
}

fn default_driver() -> String {
    String::from("virtual")
}

fn default_gamma_size() -> u32 {
    256
}

fn default_kind_id() -> u32 {
    1
}

fn default_state() -> ConnectionState {
    ConnectionState::Connected
}

fn default_refresh() -> u32 {
    60
}

fn default_possible_crtcs() -> Vec<u32> {
    vec![0]
}

fn default_true() -> bool {
    true
}

fn default_rotations() -> Vec<String> {
    ROTATION_BITS.iter().map(|(name, _)| String::from(*name)).collect()
}

fn default_blend_modes() -> Vec<String> {
    BLEND_MODES.iter().map(|(name, _)| String::from(*name)).collect()
}

impl Default for CrtcDesc {
    fn default() -> Self {
        Self {
            mode: None,
            gamma_size: default_gamma_size(),
        }
    }
}

impl ModeDesc {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            refresh: default_refresh(),
            preferred: false,
        }
    }

    fn to_mode(&self) -> ModeInfo {
        let mut mode = ModeInfo::synthetic(self.width, self.height, self.refresh);
        if self.preferred {
            mode.mode_type |= DRM_MODE_TYPE_PREFERRED;
        }
        mode
    }
}

impl PlaneDesc {
    fn with_type(ty: PlaneType, formats: &[&str]) -> Self {
        Self {
            ty,
            possible_crtcs: default_possible_crtcs(),
            formats: formats.iter().map(|f| String::from(*f)).collect(),
            zpos: None,
            rotations: default_rotations(),
            alpha: true,
            blend_modes: default_blend_modes(),
            in_fence: true,
        }
    }

    /// A fully featured primary plane on pipe 0.
    pub fn primary(formats: &[&str]) -> Self {
        Self::with_type(PlaneType::Primary, formats)
    }

    /// A fully featured overlay plane on pipe 0.
    pub fn overlay(formats: &[&str]) -> Self {
        Self::with_type(PlaneType::Overlay, formats)
    }

    pub fn cursor() -> Self {
        Self::with_type(PlaneType::Cursor, &["AR24"])
    }
}

impl ConnectorDesc {
    /// A connected connector with a single preferred 1920x1080 mode.
    pub fn connected(kind: ConnectorKind, kind_id: u32, encoders: Vec<u32>) -> Self {
        Self {
            kind,
            kind_id,
            state: ConnectionState::Connected,
            modes: vec![ModeDesc {
                preferred: true,
                ..ModeDesc::new(1920, 1080)
            }],
            encoders,
            encoder: None,
            size_mm: (0, 0),
        }
    }
}

impl HardwareDesc {
    /// One CRTC, one encoder and a connected eDP panel, with the given planes.
    pub fn single_display(planes: Vec<PlaneDesc>) -> Self {
        Self {
            driver: default_driver(),
            crtcs: vec![CrtcDesc::default()],
            encoders: vec![EncoderDesc {
                possible_crtcs: vec![0],
                possible_clones: vec![],
                crtc: None,
            }],
            connectors: vec![ConnectorDesc::connected(ConnectorKind::Edp, 1, vec![0])],
            planes,
            reject_commits: false,
            max_active_planes: None,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Property Tables
// =============================================================================

const ROTATION_BITS: [(&str, u64); 6] = [
    ("rotate-0", 0),
    ("rotate-90", 1),
    ("rotate-180", 2),
    ("rotate-270", 3),
    ("reflect-x", 4),
    ("reflect-y", 5),
];

const BLEND_MODES: [(&str, u64); 3] = [("Pre-multiplied", 0), ("Coverage", 1), ("None", 2)];

const COLOR_ENCODINGS: [(&str, u64); 3] = [
    ("ITU-R BT.601 YCbCr", 0),
    ("ITU-R BT.709 YCbCr", 1),
    ("ITU-R BT.2020 YCbCr", 2),
];

const COLOR_RANGES: [(&str, u64); 2] = [("YCbCr limited range", 0), ("YCbCr full range", 1)];

const PLANE_TYPES: [(&str, u64); 3] = [("Overlay", 0), ("Primary", 1), ("Cursor", 2)];

const DPMS: [(&str, u64); 4] = [("On", 0), ("Standby", 1), ("Suspend", 2), ("Off", 3)];

fn entries<'a>(names: impl IntoIterator<Item = (&'a str, u64)>) -> Vec<EnumEntry> {
    names
        .into_iter()
        .map(|(name, value)| EnumEntry {
            name: String::from(name),
            value,
        })
        .collect()
}

fn enum_kind(table: &[(&str, u64)]) -> PropertyKind {
    PropertyKind::Enum(entries(table.iter().copied()))
}

/// Keep the table entries whose names are listed, in table order.
fn filtered(table: &[(&'static str, u64)], names: &[String]) -> Vec<(&'static str, u64)> {
    table
        .iter()
        .copied()
        .filter(|(name, _)| names.iter().any(|n| n == name))
        .collect()
}

fn range(min: u64, max: u64) -> PropertyKind {
    PropertyKind::Range { min, max }
}

/// Assigns property ids. Like the kernel, objects of the same type share ids per name.
#[derive(Default)]
struct PropertyIds {
    ids: HashMap<(&'static str, String), PropertyId>,
}

impl PropertyIds {
    fn get(&mut self, object_type: &'static str, name: &str) -> PropertyId {
        let next = PropertyId(self.ids.len() as u32 + 1);
        *self
            .ids
            .entry((object_type, String::from(name)))
            .or_insert(next)
    }
}

struct TableBuilder<'a> {
    ids: &'a mut PropertyIds,
    object_type: &'static str,
    props: Vec<(PropertyInfo, u64)>,
}

impl<'a> TableBuilder<'a> {
    fn new(ids: &'a mut PropertyIds, object_type: &'static str) -> Self {
        Self {
            ids,
            object_type,
            props: Vec::new(),
        }
    }

    fn add(mut self, name: &str, kind: PropertyKind, value: u64) -> Self {
        self.props.push((
            PropertyInfo {
                id: self.ids.get(self.object_type, name),
                name: String::from(name),
                kind,
                immutable: false,
            },
            value,
        ));
        self
    }

    fn add_immutable(mut self, name: &str, kind: PropertyKind, value: u64) -> Self {
        self = self.add(name, kind, value);
        if let Some((info, _)) = self.props.last_mut() {
            info.immutable = true;
        }
        self
    }

    fn build(self) -> Vec<(PropertyInfo, u64)> {
        self.props
    }
}

fn plane_properties(ids: &mut PropertyIds, desc: &PlaneDesc, formats: &[u32]) -> Vec<(PropertyInfo, u64)> {
    let mut t = TableBuilder::new(ids, "plane")
        .add_immutable("type", enum_kind(&PLANE_TYPES), desc.ty as u64)
        .add("CRTC_ID", PropertyKind::Object, 0)
        .add("FB_ID", PropertyKind::Object, 0)
        .add(
            "CRTC_X",
            PropertyKind::SignedRange {
                min: i64::from(i32::MIN),
                max: i64::from(i32::MAX),
            },
            0,
        )
        .add(
            "CRTC_Y",
            PropertyKind::SignedRange {
                min: i64::from(i32::MIN),
                max: i64::from(i32::MAX),
            },
            0,
        )
        .add("CRTC_W", range(0, i32::MAX as u64), 0)
        .add("CRTC_H", range(0, i32::MAX as u64), 0)
        .add("SRC_X", range(0, u64::from(u32::MAX)), 0)
        .add("SRC_Y", range(0, u64::from(u32::MAX)), 0)
        .add("SRC_W", range(0, u64::from(u32::MAX)), 0)
        .add("SRC_H", range(0, u64::from(u32::MAX)), 0);

    if let Some(zpos) = desc.zpos {
        t = if zpos.immutable {
            t.add_immutable("zpos", range(zpos.min, zpos.max), zpos.min)
        } else {
            t.add("zpos", range(zpos.min, zpos.max), zpos.min)
        };
    }

    if !desc.rotations.is_empty() {
        let bits = filtered(&ROTATION_BITS, &desc.rotations);
        t = t.add("rotation", PropertyKind::Bitmask(entries(bits)), 1);
    }

    if desc.alpha {
        t = t.add("alpha", range(0, 0xffff), 0xffff);
    }

    if !desc.blend_modes.is_empty() {
        let modes = filtered(&BLEND_MODES, &desc.blend_modes);
        t = t.add("pixel blend mode", PropertyKind::Enum(entries(modes)), 0);
    }

    if desc.in_fence {
        t = t.add(
            "IN_FENCE_FD",
            PropertyKind::SignedRange {
                min: -1,
                max: i64::from(i32::MAX),
            },
            -1i64 as u64,
        );
    }

    if formats.iter().any(|&f| !format::is_rgb(f)) {
        t = t
            .add("COLOR_ENCODING", enum_kind(&COLOR_ENCODINGS), 0)
            .add("COLOR_RANGE", enum_kind(&COLOR_RANGES), 0);
    }

    t.build()
}

fn crtc_properties(ids: &mut PropertyIds, desc: &CrtcDesc) -> Vec<(PropertyInfo, u64)> {
    let mut t = TableBuilder::new(ids, "crtc")
        .add("ACTIVE", range(0, 1), u64::from(desc.mode.is_some()))
        .add("MODE_ID", PropertyKind::Blob, 0)
        .add("OUT_FENCE_PTR", range(0, u64::MAX), 0);

    if desc.gamma_size > 0 {
        t = t
            .add("GAMMA_LUT", PropertyKind::Blob, 0)
            .add_immutable("GAMMA_LUT_SIZE", range(0, u64::from(u32::MAX)), u64::from(desc.gamma_size));
    }

    t.build()
}

fn connector_properties(ids: &mut PropertyIds, desc: &ConnectorDesc) -> Vec<(PropertyInfo, u64)> {
    let mut t = TableBuilder::new(ids, "connector")
        .add("CRTC_ID", PropertyKind::Object, 0)
        .add("DPMS", enum_kind(&DPMS), 0);

    if desc.kind.is_writeback() {
        t = t
            .add("WRITEBACK_FB_ID", PropertyKind::Object, 0)
            .add("WRITEBACK_OUT_FENCE_PTR", range(0, u64::MAX), 0)
            .add_immutable("WRITEBACK_PIXEL_FORMATS", PropertyKind::Blob, 0);
    }

    t.build()
}

fn bitmask(indices: &[u32]) -> u32 {
    indices
        .iter()
        .filter_map(|&i| 1u32.checked_shl(i))
        .fold(0, |acc, bit| acc | bit)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

// =============================================================================
// Device
// =============================================================================

/// A commit as submitted to the device.
#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub flags: CommitFlags,
    pub request: AtomicRequest,
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<(ObjectRef, PropertyId), u64>,
    commits: Vec<RecordedCommit>,
    blobs: HashMap<BlobId, Vec<u8>>,
    framebuffers: HashMap<FramebufferId, BufferInfo>,
    next_blob: u32,
    next_fb: u32,
    reject_commits: bool,
    /// Connection state and modes reported after a simulated hotplug.
    hotplugged: HashMap<ConnectorId, (ConnectionState, Vec<ModeInfo>)>,
}

#[derive(Debug)]
pub struct VirtualDevice {
    driver: String,
    resources: ResourceIds,
    crtcs: Vec<RawCrtc>,
    encoders: Vec<RawEncoder>,
    connectors: Vec<RawConnector>,
    planes: Vec<RawPlane>,
    properties: HashMap<ObjectRef, Vec<PropertyInfo>>,
    max_active_planes: Option<usize>,
    state: Mutex<State>,
}

impl VirtualDevice {
    pub fn new(desc: HardwareDesc) -> Self {
        let mut next_id = 30;
        let mut alloc = || {
            next_id += 1;
            next_id
        };

        let crtc_ids: Vec<_> = desc.crtcs.iter().map(|_| CrtcId(alloc())).collect();
        let encoder_ids: Vec<_> = desc.encoders.iter().map(|_| EncoderId(alloc())).collect();
        let connector_ids: Vec<_> = desc.connectors.iter().map(|_| ConnectorId(alloc())).collect();
        let plane_ids: Vec<_> = desc.planes.iter().map(|_| PlaneId(alloc())).collect();

        let mut ids = PropertyIds::default();
        let mut properties = HashMap::new();
        let mut values = HashMap::new();
        let mut store = |object: ObjectRef, props: Vec<(PropertyInfo, u64)>| {
            for (info, value) in &props {
                values.insert((object, info.id), *value);
            }
            properties.insert(object, props.into_iter().map(|(info, _)| info).collect());
        };

        let crtcs = desc
            .crtcs
            .iter()
            .zip(&crtc_ids)
            .map(|(c, &id)| {
                store(ObjectRef::Crtc(id), crtc_properties(&mut ids, c));
                RawCrtc {
                    id,
                    mode: c.mode.as_ref().map(ModeDesc::to_mode),
                }
            })
            .collect();

        let encoders = desc
            .encoders
            .iter()
            .zip(&encoder_ids)
            .map(|(e, &id)| RawEncoder {
                id,
                crtc: e.crtc.and_then(|pipe| crtc_ids.get(pipe as usize).copied()),
                possible_crtcs: bitmask(&e.possible_crtcs),
                possible_clones: bitmask(&e.possible_clones),
            })
            .collect();

        let connectors = desc
            .connectors
            .iter()
            .zip(&connector_ids)
            .map(|(c, &id)| {
                store(ObjectRef::Connector(id), connector_properties(&mut ids, c));
                RawConnector {
                    id,
                    kind: c.kind,
                    kind_id: c.kind_id,
                    state: c.state,
                    size_mm: c.size_mm,
                    modes: c.modes.iter().map(ModeDesc::to_mode).collect(),
                    encoders: c
                        .encoders
                        .iter()
                        .filter_map(|&i| encoder_ids.get(i as usize).copied())
                        .collect(),
                    current_encoder: c.encoder.and_then(|i| encoder_ids.get(i as usize).copied()),
                }
            })
            .collect();

        let planes = desc
            .planes
            .iter()
            .zip(&plane_ids)
            .map(|(p, &id)| {
                let formats: Vec<u32> = p
                    .formats
                    .iter()
                    .filter_map(|f| format::parse_fourcc(f))
                    .collect();
                store(ObjectRef::Plane(id), plane_properties(&mut ids, p, &formats));
                RawPlane {
                    id,
                    possible_crtcs: bitmask(&p.possible_crtcs),
                    formats,
                }
            })
            .collect();

        let resources = ResourceIds {
            crtcs: crtc_ids,
            encoders: encoder_ids,
            connectors: connector_ids,
            planes: plane_ids,
            min_size: (0, 0),
            max_size: (8192, 8192),
        };

        Self {
            driver: desc.driver,
            resources,
            crtcs,
            encoders,
            connectors,
            planes,
            properties,
            max_active_planes: desc.max_active_planes,
            state: Mutex::new(State {
                values,
                next_blob: 100,
                next_fb: 200,
                reject_commits: desc.reject_commits,
                ..State::default()
            }),
        }
    }

    // === Inspection ===

    /// Every commit submitted so far, test-only ones included.
    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Get the current value of a property.
    pub fn property_value(&self, object: ObjectRef, name: &str) -> Option<u64> {
        let info = self.find_property(object, name)?;
        self.state.lock().unwrap().values.get(&(object, info.id)).copied()
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.lock().unwrap().framebuffers.len()
    }

    pub fn set_reject_commits(&self, reject: bool) {
        self.state.lock().unwrap().reject_commits = reject;
    }

    /// Report a new connection state and mode list for the connector at `index`, as if a
    /// monitor was plugged in or out.
    pub fn hotplug(&self, index: usize, state: ConnectionState, modes: &[ModeDesc]) {
        let Some(conn) = self.connectors.get(index) else {
            return;
        };
        let modes = modes.iter().map(ModeDesc::to_mode).collect();
        self.state
            .lock()
            .unwrap()
            .hotplugged
            .insert(conn.id, (state, modes));
    }

    fn find_property(&self, object: ObjectRef, name: &str) -> Option<&PropertyInfo> {
        self.properties.get(&object)?.iter().find(|p| p.name == name)
    }

    fn validate(&self, state: &State, flags: CommitFlags, req: &AtomicRequest) -> io::Result<()> {
        if state.reject_commits && !flags.contains(CommitFlags::TEST_ONLY) {
            return Err(invalid("commit rejected by driver"));
        }

        for write in req.writes() {
            let info = self
                .properties
                .get(&write.object)
                .and_then(|props| props.iter().find(|p| p.id == write.property))
                .ok_or_else(|| invalid(format!("{} has no {}", write.object, write.property)))?;

            if info.immutable {
                return Err(invalid(format!("{} is immutable", info.name)));
            }

            let current = state.values.get(&(write.object, write.property)).copied();
            if info.name == "MODE_ID"
                && current != Some(write.value)
                && !flags.contains(CommitFlags::ALLOW_MODESET)
            {
                return Err(invalid("modeset without ALLOW_MODESET"));
            }

            if matches!(info.kind, PropertyKind::Blob)
                && write.value != 0
                && !state.blobs.contains_key(&BlobId(write.value as u32))
            {
                return Err(invalid(format!("unknown blob {}", write.value)));
            }

            if info.name == "FB_ID"
                && write.value != 0
                && !state.framebuffers.contains_key(&FramebufferId(write.value as u32))
            {
                return Err(invalid(format!("unknown framebuffer {}", write.value)));
            }
        }

        if let Some(max) = self.max_active_planes {
            let active = self.planes.iter().filter(|p| {
                let object = ObjectRef::Plane(p.id);
                let fb = req.value(object, "FB_ID").or_else(|| {
                    let info = self.find_property(object, "FB_ID")?;
                    state.values.get(&(object, info.id)).copied()
                });
                fb.unwrap_or(0) != 0
            });
            if active.count() > max {
                return Err(invalid(format!("more than {max} active planes")));
            }
        }

        Ok(())
    }
}

impl KmsDevice for VirtualDevice {
    fn name(&self) -> String {
        self.driver.clone()
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        Ok(self.resources.clone())
    }

    fn crtc(&self, id: CrtcId) -> io::Result<RawCrtc> {
        self.crtcs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| invalid(format!("no {id}")))
    }

    fn encoder(&self, id: EncoderId) -> io::Result<RawEncoder> {
        self.encoders
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| invalid(format!("no {id}")))
    }

    fn connector(&self, id: ConnectorId) -> io::Result<RawConnector> {
        let mut conn = self
            .connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| invalid(format!("no {id}")))?;

        if let Some((state, modes)) = self.state.lock().unwrap().hotplugged.get(&id) {
            conn.state = *state;
            conn.modes = modes.clone();
        }
        Ok(conn)
    }

    fn plane(&self, id: PlaneId) -> io::Result<RawPlane> {
        self.planes
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| invalid(format!("no {id}")))
    }

    fn properties(&self, object: ObjectRef) -> io::Result<Vec<(PropertyInfo, u64)>> {
        let props = self
            .properties
            .get(&object)
            .ok_or_else(|| invalid(format!("no {object}")))?;

        let state = self.state.lock().unwrap();
        Ok(props
            .iter()
            .map(|info| {
                let value = state.values.get(&(object, info.id)).copied().unwrap_or(0);
                (info.clone(), value)
            })
            .collect())
    }

    fn atomic_commit(&self, flags: CommitFlags, req: &AtomicRequest) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        let res = self.validate(&state, flags, req);
        state.commits.push(RecordedCommit {
            flags,
            request: req.clone(),
            accepted: res.is_ok(),
        });
        res?;

        if !flags.contains(CommitFlags::TEST_ONLY) {
            for write in req.writes() {
                state.values.insert((write.object, write.property), write.value);
            }
            debug!("{}: applied commit with {} writes", self.driver, req.len());
        }

        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<BlobId> {
        let mut state = self.state.lock().unwrap();
        state.next_blob += 1;
        let id = BlobId(state.next_blob);
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .blobs
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(|| invalid(format!("no {blob}")))
    }

    fn add_framebuffer(&self, buffer: &BufferInfo) -> io::Result<FramebufferId> {
        if buffer.width == 0 || buffer.height == 0 {
            return Err(invalid("zero-sized framebuffer"));
        }

        let mut state = self.state.lock().unwrap();
        state.next_fb += 1;
        let id = FramebufferId(state.next_fb);
        state.framebuffers.insert(id, buffer.clone());
        Ok(id)
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .framebuffers
            .remove(&fb)
            .map(|_| ())
            .ok_or_else(|| invalid(format!("no {fb}")))
    }

    fn wait_vblank(&self, _pipe: u32) -> io::Result<Duration> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "virtual device has no vblank events",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARDWARE: &str = r#"{
        "crtcs": [{ "mode": { "width": 1920, "height": 1080 } }, {}],
        "encoders": [
            { "possible_crtcs": [0, 1], "crtc": 0 },
            { "possible_crtcs": [1] }
        ],
        "connectors": [
            { "kind": "eDP", "encoders": [0], "encoder": 0,
              "modes": [{ "width": 1920, "height": 1080, "preferred": true }] },
            { "kind": "HDMI-A", "state": "disconnected", "encoders": [0, 1] }
        ],
        "planes": [
            { "type": "primary", "formats": ["XR24", "AR24"] },
            { "type": "overlay", "formats": ["XR24", "NV12"], "possible_crtcs": [0, 1],
              "zpos": { "min": 1, "max": 3 } }
        ]
    }"#;

    fn device() -> VirtualDevice {
        VirtualDevice::new(HardwareDesc::from_json(HARDWARE).unwrap())
    }

    #[test]
    fn describes_objects() {
        let dev = device();
        let res = dev.resources().unwrap();
        assert_eq!(res.crtcs.len(), 2);
        assert_eq!(res.planes.len(), 2);

        let enc = dev.encoder(res.encoders[0]).unwrap();
        assert_eq!(enc.possible_crtcs, 0b11);
        assert_eq!(enc.crtc, Some(res.crtcs[0]));

        let conn = dev.connector(res.connectors[1]).unwrap();
        assert_eq!(conn.kind, ConnectorKind::HdmiA);
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert_eq!(conn.encoders, res.encoders);

        let overlay = dev.plane(res.planes[1]).unwrap();
        assert_eq!(overlay.formats, [format::XRGB8888, format::NV12]);
    }

    #[test]
    fn property_ids_are_shared_per_object_type() {
        let dev = device();
        let res = dev.resources().unwrap();
        let id_of = |object, name: &str| {
            dev.properties(object)
                .unwrap()
                .into_iter()
                .find(|(info, _)| info.name == name)
                .map(|(info, _)| info.id)
        };

        let a = id_of(ObjectRef::Plane(res.planes[0]), "FB_ID");
        let b = id_of(ObjectRef::Plane(res.planes[1]), "FB_ID");
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(id_of(ObjectRef::Plane(res.planes[0]), "COLOR_ENCODING"), None);
        assert!(id_of(ObjectRef::Plane(res.planes[1]), "COLOR_ENCODING").is_some());
    }

    #[test]
    fn commits_are_validated_and_applied() {
        let dev = device();
        let res = dev.resources().unwrap();
        let crtc = ObjectRef::Crtc(res.crtcs[1]);
        let active = dev
            .properties(crtc)
            .unwrap()
            .into_iter()
            .find(|(info, _)| info.name == "ACTIVE")
            .unwrap()
            .0;

        let mut req = AtomicRequest::new();
        req.add(crtc, active.id, "ACTIVE", 1);

        dev.atomic_commit(CommitFlags::TEST_ONLY, &req).unwrap();
        assert_eq!(dev.property_value(crtc, "ACTIVE"), Some(0));

        dev.atomic_commit(CommitFlags::empty(), &req).unwrap();
        assert_eq!(dev.property_value(crtc, "ACTIVE"), Some(1));

        dev.set_reject_commits(true);
        assert!(dev.atomic_commit(CommitFlags::empty(), &req).is_err());

        let accepted: Vec<_> = dev.commits().iter().map(|c| c.accepted).collect();
        assert_eq!(accepted, [true, true, false]);
    }

    #[test]
    fn unknown_framebuffer_is_rejected() {
        let dev = device();
        let res = dev.resources().unwrap();
        let plane = ObjectRef::Plane(res.planes[0]);
        let fb_id = dev
            .properties(plane)
            .unwrap()
            .into_iter()
            .find(|(info, _)| info.name == "FB_ID")
            .unwrap()
            .0;

        let mut req = AtomicRequest::new();
        req.add(plane, fb_id.id, "FB_ID", 999);
        assert!(dev.atomic_commit(CommitFlags::empty(), &req).is_err());
    }

    #[test]
    fn blobs_and_framebuffers_are_tracked() {
        let dev = device();
        let blob = dev.create_mode_blob(&ModeInfo::synthetic(640, 480, 60)).unwrap();
        assert_eq!(dev.blob_count(), 1);
        dev.destroy_blob(blob).unwrap();
        assert_eq!(dev.blob_count(), 0);
        assert!(dev.destroy_blob(blob).is_err());

        let buffer = BufferInfo {
            id: 7,
            width: 64,
            height: 64,
            format: format::XRGB8888,
            pitches: [256, 0, 0, 0],
            offsets: [0; 4],
            handles: [1, 0, 0, 0],
            modifiers: [0; 4],
        };
        let fb = dev.add_framebuffer(&buffer).unwrap();
        assert_eq!(dev.framebuffer_count(), 1);
        dev.remove_framebuffer(fb).unwrap();
        assert_eq!(dev.framebuffer_count(), 0);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = HardwareDesc::from_json(r#"{"crtcs": [], "encoders": [], "connectors": [], "planes": [], "bogus": 1}"#);
        assert!(err.is_err());
    }
}
