//! Frame pipeline of one display: import, plan, encode, commit.

use std::sync::Arc;

use anyhow::{bail, Context};
use kmsplan_config::PlannerKind;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::commit::{encode, CommitError, PendingCommit};
use super::composition::{
    CompositionError, DisplayComposition, DpmsMode, PlaneRole, WritebackTarget,
};
use super::planner::{PlanOptions, PlanePool};
use super::strategy::{strategy_for, ClientOnly, PlacementStrategy};
use crate::kms::{CrtcId, ModeInfo, PlaneId};
use crate::layer::{BufferInfo, FbImporter, Layer, Rect};
use crate::resources::{BindError, Crtc, ResourceGraph};

/// Counters over the life of a display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frames: u64,
    /// Pixels of every committed layer.
    pub total_pixels: u64,
    /// Pixels the client had to composite.
    pub client_pixels: u64,
    pub failed_validate: u64,
    pub failed_present: u64,
}

pub struct DisplayPipeline {
    display: u32,
    crtc: CrtcId,
    strategy: Arc<dyn PlacementStrategy>,
    options: PlanOptions,
    importer: FbImporter,

    active_mode: Option<u32>,
    pending_mode: Option<(u32, ModeInfo)>,
    pending_power: Option<DpmsMode>,
    writeback: Option<WritebackTarget>,

    frame: Option<DisplayComposition>,
    last_geometry: Vec<Rect>,
    /// Planes showing something since the last successful commit.
    lit_planes: Vec<PlaneId>,
    stats: FrameStats,
}

impl DisplayPipeline {
    pub fn new(
        graph: &ResourceGraph,
        display: u32,
        planner: PlannerKind,
        options: PlanOptions,
    ) -> Result<Self, BindError> {
        let crtc = graph
            .crtc_for_display(display)
            .ok_or(BindError::NotBound { display })?;

        let pipeline = Self {
            display,
            crtc: crtc.id(),
            strategy: Arc::from(strategy_for(planner)),
            options,
            importer: FbImporter::new(graph.device()),
            active_mode: None,
            pending_mode: None,
            pending_power: None,
            writeback: None,
            frame: None,
            last_geometry: Vec::new(),
            lit_planes: Vec::new(),
            stats: FrameStats::default(),
        };

        debug!(
            "display {}: {} with planner {planner}",
            pipeline.display, pipeline.crtc
        );
        Ok(pipeline)
    }

    // === Core Accessors ===

    pub fn display(&self) -> u32 {
        self.display
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Get the id of the mode the display runs at.
    pub fn active_mode(&self) -> Option<u32> {
        self.active_mode
    }

    /// Get the frame validated last, if any.
    pub fn frame(&self) -> Option<&DisplayComposition> {
        self.frame.as_ref()
    }

    /// Indices of the layers of the validated frame that the client must composite.
    pub fn client_layers(&self) -> Vec<usize> {
        self.frame
            .as_ref()
            .map(DisplayComposition::client_layers)
            .unwrap_or_default()
    }

    pub fn lit_planes(&self) -> &[PlaneId] {
        &self.lit_planes
    }

    // === Display Control ===

    /// Switch to the connector mode with `mode_id` on the next commit.
    pub fn set_active_mode(&mut self, graph: &ResourceGraph, mode_id: u32) -> anyhow::Result<()> {
        let conn = graph
            .connector_for_display(self.display)
            .with_context(|| format!("display {} has no connector", self.display))?;
        let mode = conn
            .mode(mode_id)
            .with_context(|| format!("{} has no mode {mode_id}", conn.name()))?;

        self.pending_mode = Some((mode_id, mode.info.clone()));
        Ok(())
    }

    /// Switch to the preferred mode of the connector on the next commit.
    pub fn choose_preferred_mode(&mut self, graph: &ResourceGraph) -> anyhow::Result<()> {
        let conn = graph
            .connector_for_display(self.display)
            .with_context(|| format!("display {} has no connector", self.display))?;
        let Some(mode) = conn.preferred_mode() else {
            bail!("{} reports no modes", conn.name());
        };

        self.pending_mode = Some((mode.id, mode.info.clone()));
        Ok(())
    }

    pub fn set_power_mode(&mut self, mode: DpmsMode) {
        self.pending_power = Some(mode);
    }

    /// Capture the following frames into `buffer`, or stop capturing with `None`.
    pub fn set_output_buffer(
        &mut self,
        graph: &ResourceGraph,
        buffer: Option<&BufferInfo>,
    ) -> anyhow::Result<()> {
        let Some(buffer) = buffer else {
            self.writeback = None;
            return Ok(());
        };

        let conn = graph
            .available_writeback_connector(self.display)
            .with_context(|| format!("no writeback connector for display {}", self.display))?;
        let fb = self
            .importer
            .get_or_create(buffer)
            .context("error importing output buffer")?;

        self.writeback = Some(WritebackTarget {
            connector: conn.id(),
            fb,
        });
        Ok(())
    }

    /// Load a gamma ramp, or reset to linear with `None`.
    pub fn set_gamma(&self, graph: &ResourceGraph, ramp: Option<&[u16]>) -> anyhow::Result<()> {
        let crtc = self.crtc_in(graph).context("error getting CRTC")?;

        let mut pending = PendingCommit::new();
        if let Some(blob) = crtc.stage_gamma(graph.device(), pending.request_mut(), ramp)? {
            pending.keep_blob(blob);
        }
        pending
            .commit(&**graph.device(), false)
            .context("error committing gamma")?;
        Ok(())
    }

    // === Frames ===

    /// Plan `layers` with the configured strategy and return the planes left for other
    /// displays.
    pub fn validate<'a>(
        &mut self,
        graph: &ResourceGraph,
        layers: Vec<Layer>,
        client_target: Option<Layer>,
        pool: &PlanePool<'a>,
    ) -> Result<PlanePool<'a>, CompositionError> {
        let strategy = self.strategy.clone();
        self.prepare(&*strategy, graph, layers, client_target, pool)
    }

    /// Plan `layers` entirely for client composition, as a retry after the driver rejected a
    /// frame.
    pub fn validate_client_only<'a>(
        &mut self,
        graph: &ResourceGraph,
        layers: Vec<Layer>,
        client_target: Option<Layer>,
        pool: &PlanePool<'a>,
    ) -> Result<PlanePool<'a>, CompositionError> {
        self.prepare(&ClientOnly, graph, layers, client_target, pool)
    }

    fn prepare<'a>(
        &mut self,
        strategy: &dyn PlacementStrategy,
        graph: &ResourceGraph,
        mut layers: Vec<Layer>,
        mut client_target: Option<Layer>,
        pool: &PlanePool<'a>,
    ) -> Result<PlanePool<'a>, CompositionError> {
        let _span = tracy_client::span!("DisplayPipeline::prepare");

        let crtc = self.crtc_in(graph)?;

        for layer in layers.iter_mut().chain(client_target.as_mut()) {
            self.import(layer);
        }

        let geometry: Vec<Rect> = layers.iter().map(|l| l.display_frame).collect();
        let geometry_changed = geometry != self.last_geometry;

        let mut comp = DisplayComposition::new(self.display, crtc.id());
        let res = self
            .fill(&mut comp, layers, client_target, geometry_changed)
            .and_then(|()| comp.plan(strategy, crtc, pool, self.options));

        let mut remaining = match res {
            Ok(remaining) => remaining,
            Err(err) => {
                self.stats.failed_validate += 1;
                debug!("display {}: {} failed: {err}", self.display, strategy.name());
                return Err(err);
            }
        };

        // Take planes this frame no longer uses off the screen, unless another display
        // already claimed them.
        let used: Vec<PlaneId> = comp
            .composition_planes()
            .iter()
            .filter_map(|p| p.plane())
            .collect();
        for id in &self.lit_planes {
            if used.contains(id) {
                continue;
            }
            if let Some(plane) = remaining.get(*id) {
                trace!("display {}: disabling {id}", self.display);
                comp.add_plane_disable(plane, &mut remaining);
            }
        }

        self.last_geometry = geometry;
        self.frame = Some(comp);
        Ok(remaining)
    }

    fn fill(
        &self,
        comp: &mut DisplayComposition,
        layers: Vec<Layer>,
        client_target: Option<Layer>,
        geometry_changed: bool,
    ) -> Result<(), CompositionError> {
        comp.set_layers(layers, geometry_changed)?;
        if let Some(target) = client_target {
            comp.set_client_target(target)?;
        }
        if let Some(writeback) = self.writeback {
            comp.set_writeback(writeback)?;
        }
        Ok(())
    }

    fn import(&mut self, layer: &mut Layer) {
        if layer.fb.is_some() || layer.buffer.is_none() {
            return;
        }

        if let Err(err) = layer.import_buffer(&mut self.importer) {
            // Without a framebuffer the layer goes to the client.
            warn!("display {}: error importing buffer: {err:?}", self.display);
        }
    }

    fn crtc_in<'g>(&self, graph: &'g ResourceGraph) -> Result<&'g Crtc, CompositionError> {
        graph.crtc(self.crtc).ok_or(CompositionError::NoCrtc {
            display: self.display,
            crtc: self.crtc,
        })
    }

    /// Stage the pending mode and power changes and the validated frame into `pending`.
    pub fn encode_into(
        &self,
        graph: &ResourceGraph,
        pending: &mut PendingCommit,
    ) -> Result<(), CommitError> {
        let mut staged = PendingCommit::new();

        if let Some((_, mode)) = &self.pending_mode {
            let mut modeset = DisplayComposition::new(self.display, self.crtc);
            modeset
                .set_display_mode(mode.clone())
                .map_err(|_| CommitError::NoMode)?;
            encode(&modeset, graph, &mut staged)?;
        }

        match self.pending_power {
            Some(DpmsMode::Off) => {
                let mut dpms = DisplayComposition::new(self.display, self.crtc);
                let mut pool = PlanePool::from_graph(graph);
                for id in &self.lit_planes {
                    if let Some(plane) = graph.plane(*id) {
                        dpms.add_plane_disable(plane, &mut pool);
                    }
                }
                if dpms.set_dpms_mode(DpmsMode::Off).is_ok() {
                    encode(&dpms, graph, &mut staged)?;
                }
            }
            Some(DpmsMode::On) => {
                let mut dpms = DisplayComposition::new(self.display, self.crtc);
                if dpms.set_dpms_mode(DpmsMode::On).is_ok() {
                    encode(&dpms, graph, &mut staged)?;
                }
                if let Some(frame) = &self.frame {
                    encode(frame, graph, &mut staged)?;
                }
            }
            None => {
                if let Some(frame) = &self.frame {
                    encode(frame, graph, &mut staged)?;
                }
            }
        }

        pending.merge(staged);
        Ok(())
    }

    /// Record that the encoded state reached the hardware.
    pub fn committed(&mut self) {
        if let Some((id, _)) = self.pending_mode.take() {
            self.active_mode = Some(id);
        }

        if self.pending_power.take() == Some(DpmsMode::Off) {
            self.lit_planes.clear();
            return;
        }

        let Some(frame) = &self.frame else {
            return;
        };

        self.lit_planes = frame
            .composition_planes()
            .iter()
            .filter(|p| p.role() == PlaneRole::Layer)
            .filter_map(|p| p.plane())
            .collect();

        let area = |i: usize| frame.layers().get(i).map_or(0, |l| l.display_frame.area());
        self.stats.frames += 1;
        self.stats.total_pixels += (0..frame.layers().len()).map(area).sum::<u64>();
        self.stats.client_pixels += frame.client_layers().into_iter().map(area).sum::<u64>();
    }

    pub(super) fn record_failed_present(&mut self) {
        self.stats.failed_present += 1;
    }

    /// Commit the pending changes and the validated frame of this display alone.
    pub fn present(&mut self, graph: &ResourceGraph) -> Result<(), CommitError> {
        let _span = tracy_client::span!("DisplayPipeline::present");

        let mut pending = PendingCommit::new();
        let res = self
            .encode_into(graph, &mut pending)
            .and_then(|()| pending.commit(&**graph.device(), false));

        match res {
            Ok(()) => {
                self.committed();
                Ok(())
            }
            Err(err) => {
                self.stats.failed_present += 1;
                Err(err)
            }
        }
    }

    /// Drop the framebuffer of a buffer the display server no longer uses.
    pub fn retire_buffer(&mut self, buffer_id: u64) {
        self.importer.retire(buffer_id);
    }

    /// Remove every framebuffer this display imported.
    pub fn clear_framebuffers(&mut self) {
        self.importer.clear();
    }
}
