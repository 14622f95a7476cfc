//! Intended hardware state change of one display for one commit.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use super::planner::{PlanOptions, PlanePool};
use super::strategy::PlacementStrategy;
use crate::kms::{ConnectorId, CrtcId, FramebufferId, ModeInfo, PlaneId};
use crate::layer::Layer;
use crate::plane::Plane;
use crate::resources::Crtc;

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("cannot turn a {current} composition into a {requested} one")]
    WrongKind {
        current: CompositionKind,
        requested: CompositionKind,
    },
    #[error("layer {index} has invalid geometry")]
    InvalidGeometry { index: usize },
    #[error("protected layer {layer} cannot be composited by the client")]
    Allocation { layer: usize },
    #[error("no free primary plane for {crtc}")]
    NoPrimaryPlane { crtc: CrtcId },
    #[error("{plane} was planned but is not free")]
    PlaneNotFree { plane: PlaneId },
    #[error("{crtc} of display {display} is gone")]
    NoCrtc { display: u32, crtc: CrtcId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositionKind {
    Empty,
    Frame,
    Dpms,
    Modeset,
}

impl fmt::Display for CompositionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompositionKind::Empty => "empty",
            CompositionKind::Frame => "frame",
            CompositionKind::Dpms => "dpms",
            CompositionKind::Modeset => "modeset",
        })
    }
}

/// Display power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DpmsMode {
    #[default]
    On,
    Off,
}

impl DpmsMode {
    /// Value of the CRTC `ACTIVE` property.
    pub fn active(self) -> u64 {
        u64::from(self == DpmsMode::On)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneRole {
    /// Take the plane off the CRTC.
    Disable,
    /// Show layers on the plane.
    Layer,
}

/// One entry of a composition plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionPlane {
    role: PlaneRole,
    /// `None` for layers no plane shows.
    plane: Option<PlaneId>,
    crtc: CrtcId,
    source_layers: Vec<usize>,
    /// The source layers are drawn into the client target, which the plane scans out.
    composited: bool,
}

impl CompositionPlane {
    /// A plane showing one layer as it is.
    pub fn direct(plane: PlaneId, crtc: CrtcId, layer: usize) -> Self {
        Self {
            role: PlaneRole::Layer,
            plane: Some(plane),
            crtc,
            source_layers: vec![layer],
            composited: false,
        }
    }

    /// A plane showing the client target, into which `layers` are composited.
    pub fn composited(plane: PlaneId, crtc: CrtcId, layers: Vec<usize>) -> Self {
        Self {
            role: PlaneRole::Layer,
            plane: Some(plane),
            crtc,
            source_layers: layers,
            composited: true,
        }
    }

    /// Layers left to client composition without any plane to show them.
    pub fn client(crtc: CrtcId, layers: Vec<usize>) -> Self {
        Self {
            role: PlaneRole::Layer,
            plane: None,
            crtc,
            source_layers: layers,
            composited: true,
        }
    }

    pub fn disable(plane: PlaneId, crtc: CrtcId) -> Self {
        Self {
            role: PlaneRole::Disable,
            plane: Some(plane),
            crtc,
            source_layers: Vec::new(),
            composited: false,
        }
    }

    pub fn role(&self) -> PlaneRole {
        self.role
    }

    pub fn plane(&self) -> Option<PlaneId> {
        self.plane
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn source_layers(&self) -> &[usize] {
        &self.source_layers
    }

    pub fn is_composited(&self) -> bool {
        self.composited
    }

    pub fn add_source_layer(&mut self, layer: usize) {
        self.source_layers.push(layer);
    }
}

/// Writeback capture requested together with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritebackTarget {
    pub connector: ConnectorId,
    pub fb: FramebufferId,
}

/// What one display should do in the next commit: show a frame, change power state or change
/// mode. The kind is fixed by the first setter called.
#[derive(Debug, Clone)]
pub struct DisplayComposition {
    kind: CompositionKind,
    display: u32,
    crtc: CrtcId,

    layers: Vec<Layer>,
    geometry_changed: bool,
    planes: Vec<CompositionPlane>,
    client_target: Option<Layer>,
    writeback: Option<WritebackTarget>,

    dpms_mode: DpmsMode,
    mode: Option<ModeInfo>,
}

impl DisplayComposition {
    pub fn new(display: u32, crtc: CrtcId) -> Self {
        Self {
            kind: CompositionKind::Empty,
            display,
            crtc,
            layers: Vec::new(),
            geometry_changed: false,
            planes: Vec::new(),
            client_target: None,
            writeback: None,
            dpms_mode: DpmsMode::On,
            mode: None,
        }
    }

    // === Core Accessors ===

    pub fn kind(&self) -> CompositionKind {
        self.kind
    }

    pub fn display(&self) -> u32 {
        self.display
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn geometry_changed(&self) -> bool {
        self.geometry_changed
    }

    pub fn composition_planes(&self) -> &[CompositionPlane] {
        &self.planes
    }

    pub fn client_target(&self) -> Option<&Layer> {
        self.client_target.as_ref()
    }

    pub fn writeback(&self) -> Option<WritebackTarget> {
        self.writeback
    }

    pub fn dpms_mode(&self) -> DpmsMode {
        self.dpms_mode
    }

    pub fn display_mode(&self) -> Option<&ModeInfo> {
        self.mode.as_ref()
    }

    /// Indices of the layers that the client must composite.
    pub fn client_layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = self
            .planes
            .iter()
            .filter(|p| p.role == PlaneRole::Layer && p.composited)
            .flat_map(|p| p.source_layers.iter().copied())
            .collect();
        layers.sort_unstable();
        layers
    }

    // === Building ===

    /// Check that the composition can become (or already is) a `kind` composition.
    pub fn validate_kind(&self, kind: CompositionKind) -> Result<(), CompositionError> {
        if self.kind == CompositionKind::Empty || self.kind == kind {
            Ok(())
        } else {
            Err(CompositionError::WrongKind {
                current: self.kind,
                requested: kind,
            })
        }
    }

    /// Make this a frame composition showing `layers`, bottom first.
    ///
    /// Zero-area rectangles are accepted, such layers simply never get a plane. Inverted or
    /// non-finite rectangles are rejected.
    pub fn set_layers(
        &mut self,
        layers: Vec<Layer>,
        geometry_changed: bool,
    ) -> Result<(), CompositionError> {
        self.validate_kind(CompositionKind::Frame)?;

        for (index, layer) in layers.iter().enumerate() {
            let frame = layer.display_frame;
            let crop = layer.source_crop;
            if frame.width() < 0
                || frame.height() < 0
                || !crop.is_finite()
                || crop.width() < 0.
                || crop.height() < 0.
            {
                return Err(CompositionError::InvalidGeometry { index });
            }
        }

        self.layers = layers;
        self.geometry_changed = geometry_changed;
        self.kind = CompositionKind::Frame;
        Ok(())
    }

    /// Set the buffer the client composites into.
    pub fn set_client_target(&mut self, target: Layer) -> Result<(), CompositionError> {
        self.validate_kind(CompositionKind::Frame)?;
        self.client_target = Some(target);
        self.kind = CompositionKind::Frame;
        Ok(())
    }

    pub fn set_writeback(&mut self, target: WritebackTarget) -> Result<(), CompositionError> {
        self.validate_kind(CompositionKind::Frame)?;
        self.writeback = Some(target);
        self.kind = CompositionKind::Frame;
        Ok(())
    }

    pub fn set_dpms_mode(&mut self, mode: DpmsMode) -> Result<(), CompositionError> {
        self.validate_kind(CompositionKind::Dpms)?;
        self.dpms_mode = mode;
        self.kind = CompositionKind::Dpms;
        Ok(())
    }

    /// Make this a modeset to `mode`, which also turns the display on.
    pub fn set_display_mode(&mut self, mode: ModeInfo) -> Result<(), CompositionError> {
        self.validate_kind(CompositionKind::Modeset)?;
        self.mode = Some(mode);
        self.dpms_mode = DpmsMode::On;
        self.kind = CompositionKind::Modeset;
        Ok(())
    }

    /// Take `plane` off the CRTC, claiming it from `pool` right away.
    pub fn add_plane_disable(&mut self, plane: &Plane, pool: &mut PlanePool<'_>) {
        pool.remove(plane);
        self.planes
            .push(CompositionPlane::disable(plane.id(), self.crtc));
    }

    // === Planning ===

    /// Assign the layers to planes from `pool` and return the planes left for other displays.
    ///
    /// Anything but a frame composition has nothing to plan and gets the pool back unchanged.
    pub fn plan<'a>(
        &mut self,
        strategy: &dyn PlacementStrategy,
        crtc: &Crtc,
        pool: &PlanePool<'a>,
        options: PlanOptions,
    ) -> Result<PlanePool<'a>, CompositionError> {
        let _span = tracy_client::span!("DisplayComposition::plan");
        debug_assert_eq!(crtc.id(), self.crtc);

        if self.kind != CompositionKind::Frame {
            return Ok(pool.clone());
        }

        let layers: Vec<(usize, &Layer)> = self.layers.iter().enumerate().collect();
        let mut planned = strategy.provision(&layers, crtc, pool, options)?;

        let mut remaining = pool.clone();
        for entry in &mut planned {
            let Some(id) = entry.plane else {
                continue;
            };

            entry.source_layers.sort_unstable();

            let plane = remaining
                .get(id)
                .ok_or(CompositionError::PlaneNotFree { plane: id })?;
            remaining.remove(plane);
        }

        trace!(
            "display {}: {} planned with {} planes, {} free",
            self.display,
            strategy.name(),
            planned.len(),
            remaining.len()
        );
        if planned.iter().any(|p| p.composited) {
            debug!(
                "display {}: client composites layers {:?}",
                self.display,
                planned
                    .iter()
                    .filter(|p| p.composited)
                    .flat_map(|p| &p.source_layers)
                    .collect::<Vec<_>>()
            );
        }

        self.planes.extend(planned);
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compositor::commit::{encode, CommitError, PendingCommit};
    use crate::kms::virt::{HardwareDesc, PlaneDesc, VirtualDevice};
    use crate::kms::KmsDevice;
    use crate::layer::{format, BufferInfo, Rect, RectF};
    use crate::resources::ResourceGraph;

    fn layer() -> Layer {
        let buffer = BufferInfo {
            id: 1,
            width: 64,
            height: 64,
            format: format::XRGB8888,
            pitches: [256, 0, 0, 0],
            offsets: [0; 4],
            handles: [1, 0, 0, 0],
            modifiers: [0; 4],
        };
        Layer::new(buffer, Rect::from_size(64, 64))
    }

    #[test]
    fn kind_is_fixed_once_set() {
        let mut comp = DisplayComposition::new(0, CrtcId(31));
        comp.set_layers(vec![layer()], false).unwrap();
        comp.set_layers(vec![layer(), layer()], true).unwrap();
        assert_eq!(comp.kind(), CompositionKind::Frame);

        let err = comp.set_dpms_mode(DpmsMode::Off).unwrap_err();
        assert!(matches!(
            err,
            CompositionError::WrongKind {
                current: CompositionKind::Frame,
                requested: CompositionKind::Dpms
            }
        ));
        assert_eq!(comp.layers().len(), 2);
    }

    #[test]
    fn modeset_implies_dpms_on() {
        let mut comp = DisplayComposition::new(0, CrtcId(31));
        comp.set_display_mode(ModeInfo::synthetic(1280, 720, 60)).unwrap();
        assert_eq!(comp.kind(), CompositionKind::Modeset);
        assert_eq!(comp.dpms_mode(), DpmsMode::On);
        assert!(comp.set_layers(vec![], false).is_err());
    }

    #[test]
    fn inverted_geometry_is_rejected() {
        let mut inverted = layer();
        inverted.display_frame = Rect::new(10, 10, 0, 20);

        let mut comp = DisplayComposition::new(0, CrtcId(31));
        let err = comp.set_layers(vec![layer(), inverted], false).unwrap_err();
        assert!(matches!(err, CompositionError::InvalidGeometry { index: 1 }));
        assert_eq!(comp.kind(), CompositionKind::Empty);
        assert!(comp.layers().is_empty());
    }

    #[test]
    fn zero_area_is_accepted() {
        let mut empty = layer();
        empty.source_crop = RectF::new(0., 0., 0., 0.);

        let mut comp = DisplayComposition::new(0, CrtcId(31));
        comp.set_layers(vec![empty], false).unwrap();
    }

    #[test]
    fn client_layers_are_collected() {
        let mut comp = DisplayComposition::new(0, CrtcId(31));
        comp.planes = vec![
            CompositionPlane::composited(PlaneId(40), CrtcId(31), vec![2, 0]),
            CompositionPlane::direct(PlaneId(41), CrtcId(31), 1),
            CompositionPlane::client(CrtcId(31), vec![3]),
        ];
        assert_eq!(comp.client_layers(), [0, 2, 3]);
    }

    /// Proposes the source layers of the primary plane top first.
    struct TopFirst;

    impl PlacementStrategy for TopFirst {
        fn name(&self) -> &'static str {
            "top-first"
        }

        fn provision(
            &self,
            _layers: &[(usize, &Layer)],
            crtc: &Crtc,
            pool: &PlanePool<'_>,
            _options: PlanOptions,
        ) -> Result<Vec<CompositionPlane>, CompositionError> {
            let primary = pool.primary_for(crtc).unwrap();
            let overlay = pool.overlays_for(crtc)[0];
            Ok(vec![
                CompositionPlane::composited(primary.id(), crtc.id(), vec![2, 0]),
                CompositionPlane::direct(overlay.id(), crtc.id(), 1),
            ])
        }
    }

    fn graph() -> ResourceGraph {
        let planes = vec![PlaneDesc::primary(&["XR24"]), PlaneDesc::overlay(&["XR24"])];
        let device: Arc<dyn KmsDevice> =
            Arc::new(VirtualDevice::new(HardwareDesc::single_display(planes)));
        ResourceGraph::new(device, &[], 0).unwrap()
    }

    #[test]
    fn planned_source_layers_are_sorted() {
        let graph = graph();
        let crtc = &graph.crtcs()[0];
        let pool = PlanePool::from_graph(&graph);

        let mut comp = DisplayComposition::new(0, crtc.id());
        comp.set_layers(vec![layer(), layer(), layer()], false).unwrap();
        let remaining = comp
            .plan(&TopFirst, crtc, &pool, PlanOptions::default())
            .unwrap();

        let entries = comp.composition_planes();
        assert_eq!(entries[0].source_layers(), [0, 2]);
        assert_eq!(entries[1].source_layers(), [1]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn plane_without_layers_is_not_encoded() {
        let graph = graph();
        let crtc = &graph.crtcs()[0];
        let primary = graph.planes()[0].id();

        let mut comp = DisplayComposition::new(0, crtc.id());
        comp.set_layers(vec![layer()], false).unwrap();
        comp.planes = vec![CompositionPlane {
            role: PlaneRole::Layer,
            plane: Some(primary),
            crtc: crtc.id(),
            source_layers: Vec::new(),
            composited: false,
        }];

        let mut pending = PendingCommit::new();
        let err = encode(&comp, &graph, &mut pending).unwrap_err();
        assert!(matches!(err, CommitError::NoSourceLayer { plane } if plane == primary));
        assert!(pending.is_empty());
    }
}
