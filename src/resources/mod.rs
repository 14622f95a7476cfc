//! The connector → encoder → CRTC graph of one device.
//!
//! The graph is resolved once when a device is opened:
//! - CRTCs, encoders and connectors are read and linked together
//! - every usable connector gets a display index, the primary display first
//! - planes are read last
//! - each display is bound to an encoder and a CRTC, and gets a writeback connector if one fits

mod connector;
mod crtc;
mod encoder;
mod manager;

use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub use connector::{Connector, Mode, WritebackProps};
pub use crtc::Crtc;
pub use encoder::Encoder;
pub use manager::ResourceManager;

use crate::kms::{ConnectorId, CrtcId, EncoderId, KmsDevice, PlaneId};
use crate::plane::Plane;

/// Marks the end of an explicit primary display list: other connected connectors may follow.
pub const DISPLAY_ORDER_WILDCARD: &str = "...";

#[derive(Debug, Error)]
pub enum BindError {
    #[error("no suitable encoder/CRTC for {connector}")]
    NoEncoderCrtc { connector: String },
    #[error("{connector} has no display index")]
    NoDisplay { connector: String },
    #[error("display {display} is not bound to a CRTC")]
    NotBound { display: u32 },
    #[error("display {display} already has a writeback connector")]
    WritebackAttached { display: u32 },
    #[error("no writeback connector fits display {display}")]
    NoWriteback { display: u32 },
}

/// Resolved display resources of one KMS device.
pub struct ResourceGraph {
    device: Arc<dyn KmsDevice>,
    crtcs: Vec<Crtc>,
    encoders: Vec<Encoder>,
    connectors: Vec<Connector>,
    writeback_connectors: Vec<Connector>,
    planes: Vec<Plane>,
    displays: Vec<u32>,
    min_size: (u32, u32),
    max_size: (u32, u32),
    next_mode_id: u32,
}

impl ResourceGraph {
    /// Resolve the graph of `device`, numbering its displays from `first_display`.
    ///
    /// Only the device that gets display 0 picks a primary display.
    pub fn new(
        device: Arc<dyn KmsDevice>,
        primary_order: &[String],
        first_display: u32,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("ResourceGraph::new");

        let res = device.resources().context("error getting resources")?;
        let mut next_mode_id = 0;

        let mut crtcs = Vec::with_capacity(res.crtcs.len());
        for (pipe, id) in res.crtcs.iter().enumerate() {
            let raw = device
                .crtc(*id)
                .with_context(|| format!("error getting {id}"))?;
            let crtc = Crtc::new(&*device, raw, pipe as u32)
                .with_context(|| format!("error initializing {id}"))?;
            crtcs.push(crtc);
        }

        let mut encoders = Vec::with_capacity(res.encoders.len());
        let mut clone_masks = Vec::with_capacity(res.encoders.len());
        for id in &res.encoders {
            let raw = device
                .encoder(*id)
                .with_context(|| format!("error getting {id}"))?;

            let possible_crtcs = crtcs
                .iter()
                .filter(|c| {
                    1u32.checked_shl(c.pipe())
                        .is_some_and(|bit| raw.possible_crtcs & bit != 0)
                })
                .map(Crtc::id)
                .collect();
            let current = raw.crtc.filter(|crtc| crtcs.iter().any(|c| c.id() == *crtc));

            encoders.push(Encoder::new(raw.id, current, possible_crtcs));
            clone_masks.push(raw.possible_clones);
        }
        link_clones(&mut encoders, &clone_masks);

        let mut connectors = Vec::new();
        let mut writeback_connectors = Vec::new();
        for id in &res.connectors {
            let mut raw = device
                .connector(*id)
                .with_context(|| format!("error getting {id}"))?;
            raw.encoders
                .retain(|enc| encoders.iter().any(|e| e.id() == *enc));
            raw.current_encoder = raw
                .current_encoder
                .filter(|enc| encoders.iter().any(|e| e.id() == *enc));

            let conn = Connector::new(&*device, raw, &mut next_mode_id)
                .with_context(|| format!("error initializing {id}"))?;
            if conn.is_writeback() {
                writeback_connectors.push(conn);
            } else {
                connectors.push(conn);
            }
        }

        let displays = assign_displays(&mut connectors, primary_order, first_display);

        let mut planes = Vec::with_capacity(res.planes.len());
        for id in &res.planes {
            let raw = device
                .plane(*id)
                .with_context(|| format!("error getting {id}"))?;
            let plane =
                Plane::new(&*device, raw).with_context(|| format!("error initializing {id}"))?;
            planes.push(plane);
        }

        let mut graph = Self {
            device,
            crtcs,
            encoders,
            connectors,
            writeback_connectors,
            planes,
            displays,
            min_size: res.min_size,
            max_size: res.max_size,
            next_mode_id,
        };

        for idx in 0..graph.connectors.len() {
            let Some(id) = graph.connectors[idx].display() else {
                continue;
            };

            if let Err(err) = graph.bind_display(idx) {
                warn!("display {id} stays inactive: {err}");
                continue;
            }

            match graph.attach_writeback(id) {
                Ok(conn) => debug!("display {id} has writeback {conn} attached"),
                Err(err) => trace!("{err}"),
            }
        }

        debug!(
            "{}: {} crtcs, {} encoders, {} connectors, {} writeback connectors, {} planes, displays {:?}",
            graph.device.name(),
            graph.crtcs.len(),
            graph.encoders.len(),
            graph.connectors.len(),
            graph.writeback_connectors.len(),
            graph.planes.len(),
            graph.displays,
        );

        Ok(graph)
    }

    // === Core Accessors ===

    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.device
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn writeback_connectors(&self) -> &[Connector] {
        &self.writeback_connectors
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn min_size(&self) -> (u32, u32) {
        self.min_size
    }

    pub fn max_size(&self) -> (u32, u32) {
        self.max_size
    }

    /// Get every display index handled by this device, in ascending order.
    pub fn displays(&self) -> &[u32] {
        &self.displays
    }

    pub fn handles_display(&self, display: u32) -> bool {
        self.displays.contains(&display)
    }

    // === Lookup ===

    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.iter().find(|c| c.id() == id)
    }

    pub fn encoder(&self, id: EncoderId) -> Option<&Encoder> {
        self.encoders.iter().find(|e| e.id() == id)
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors
            .iter()
            .chain(&self.writeback_connectors)
            .find(|c| c.id() == id)
    }

    pub fn plane(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.iter().find(|p| p.id() == id)
    }

    pub fn connector_for_display(&self, display: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.display() == Some(display))
    }

    pub fn writeback_for_display(&self, display: u32) -> Option<&Connector> {
        self.writeback_connectors
            .iter()
            .find(|c| c.display() == Some(display))
    }

    pub fn crtc_for_display(&self, display: u32) -> Option<&Crtc> {
        self.crtcs.iter().find(|c| c.display() == Some(display))
    }

    // === Binding ===

    /// Bind the connector at `idx` to an encoder and a CRTC.
    ///
    /// The connector's current encoder is tried first, then every possible encoder in order.
    /// The first CRTC that is free or already driving the display wins.
    fn bind_display(&mut self, idx: usize) -> Result<(), BindError> {
        let conn = &self.connectors[idx];
        let display = conn.display().ok_or_else(|| BindError::NoDisplay {
            connector: conn.name(),
        })?;
        let current = conn.encoder();
        let candidates = conn.encoders().to_vec();

        if let Some(encoder) = current {
            if self.try_encoder_for_display(display, encoder) {
                return Ok(());
            }
        }

        for encoder in candidates {
            if self.try_encoder_for_display(display, encoder) {
                self.connectors[idx].set_encoder(encoder);
                return Ok(());
            }
        }

        Err(BindError::NoEncoderCrtc {
            connector: self.connectors[idx].name(),
        })
    }

    fn try_encoder_for_display(&mut self, id: u32, encoder: EncoderId) -> bool {
        let Some(enc) = self.encoders.iter_mut().find(|e| e.id() == encoder) else {
            return false;
        };

        // Never take an encoder away from another display.
        if !enc.can_bind(id) {
            return false;
        }

        let current = enc.crtc();
        let candidates: Vec<CrtcId> = current
            .into_iter()
            .chain(
                enc.possible_crtcs()
                    .iter()
                    .copied()
                    .filter(|crtc| Some(*crtc) != current),
            )
            .collect();

        for crtc_id in candidates {
            let Some(crtc) = self.crtcs.iter_mut().find(|c| c.id() == crtc_id) else {
                continue;
            };

            if crtc.can_bind(id) {
                crtc.set_display(id);
                enc.bind(crtc_id, id);
                trace!("display {id}: {encoder} -> {crtc_id}");
                return true;
            }
        }

        false
    }

    // === Writeback ===

    /// Attach a free writeback connector to the CRTC driving `display`.
    pub fn attach_writeback(&mut self, display: u32) -> Result<ConnectorId, BindError> {
        let crtc = self
            .crtc_for_display(display)
            .map(Crtc::id)
            .ok_or(BindError::NotBound { display })?;

        if self.writeback_for_display(display).is_some() {
            return Err(BindError::WritebackAttached { display });
        }

        for wb in &mut self.writeback_connectors {
            if wb.display().is_some() {
                continue;
            }

            for encoder in wb.encoders().to_vec() {
                let Some(enc) = self.encoders.iter_mut().find(|e| e.id() == encoder) else {
                    continue;
                };

                if enc.possible_crtcs().contains(&crtc) && enc.can_bind(display) {
                    enc.bind(crtc, display);
                    wb.set_encoder(encoder);
                    wb.set_display(display);
                    if let Err(err) = wb.update_modes(&*self.device, &mut self.next_mode_id) {
                        warn!("error updating modes of {}: {err:?}", wb.name());
                    }
                    return Ok(wb.id());
                }
            }
        }

        Err(BindError::NoWriteback { display })
    }

    /// Find a writeback connector that can capture `display`.
    ///
    /// A writeback connector already attached to the display is used when its encoder can be
    /// cloned with the display's. Otherwise one is borrowed from a CRTC with nothing connected.
    pub fn available_writeback_connector(&self, display: u32) -> Option<&Connector> {
        let display_conn = self.connector_for_display(display);
        let wb = self.writeback_for_display(display);

        if let (Some(display_conn), Some(wb)) = (display_conn, wb) {
            let clonable = match (wb.encoder(), display_conn.encoder()) {
                (Some(wb_enc), Some(display_enc)) => self
                    .encoder(wb_enc)
                    .is_some_and(|e| e.can_clone(display_enc)),
                _ => false,
            };
            if clonable {
                return Some(wb);
            }
        }

        for crtc in &self.crtcs {
            match crtc.display() {
                Some(other) if other == display => continue,
                Some(other) => {
                    // Don't take writeback away from a lit display.
                    if self
                        .connector_for_display(other)
                        .is_some_and(Connector::is_connected)
                    {
                        continue;
                    }
                    if let Some(wb) = self.writeback_for_display(other) {
                        return Some(wb);
                    }
                }
                None => {
                    if let Some(wb) = self.writeback_connectors.iter().find(|c| c.display().is_none()) {
                        return Some(wb);
                    }
                }
            }
        }

        None
    }

    /// Re-read the modes of the connector driving `display`.
    pub fn update_modes(&mut self, display: u32) -> anyhow::Result<()> {
        let conn = self
            .connectors
            .iter_mut()
            .find(|c| c.display() == Some(display))
            .with_context(|| format!("no connector for display {display}"))?;
        conn.update_modes(&*self.device, &mut self.next_mode_id)
            .with_context(|| format!("error updating modes of {}", conn.name()))
    }
}

/// Link encoders that can be cloned with each other, in both directions.
fn link_clones(encoders: &mut [Encoder], clone_masks: &[u32]) {
    for (i, mask) in clone_masks.iter().enumerate() {
        for j in 0..encoders.len() {
            if i == j || !1u32.checked_shl(j as u32).is_some_and(|bit| mask & bit != 0) {
                continue;
            }

            let (a, b) = (encoders[i].id(), encoders[j].id());
            encoders[i].add_clone(b);
            encoders[j].add_clone(a);
        }
    }
}

/// Order connected connectors by how much they deserve to be the primary display.
///
/// Listed names come first, in list order. If the list is empty or ends with
/// [`DISPLAY_ORDER_WILDCARD`], internal panels follow, then everything else; otherwise
/// connectors that are not listed are dropped.
fn primary_candidates(connectors: &[Connector], order: &[String]) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..connectors.len())
        .filter(|&i| connectors[i].is_connected())
        .collect();

    let use_other = order.last().map_or(true, |name| name == DISPLAY_ORDER_WILDCARD);

    let mut front = 0;
    for name in order {
        let found = candidates[front..]
            .iter()
            .position(|&i| connectors[i].name() == *name);
        if let Some(pos) = found {
            let idx = candidates.remove(front + pos);
            candidates.insert(front, idx);
            front += 1;
        }
    }

    if use_other {
        let (internal, other): (Vec<usize>, Vec<usize>) = candidates[front..]
            .iter()
            .partition(|&&i| connectors[i].is_internal());
        candidates.truncate(front);
        candidates.extend(internal);
        candidates.extend(other);
    } else {
        candidates.truncate(front);
    }

    candidates
}

/// Give every internal and external connector a display index and return the indices.
fn assign_displays(connectors: &mut [Connector], order: &[String], first_display: u32) -> Vec<u32> {
    let mut displays = Vec::new();
    let mut next = first_display;
    let mut found_primary = first_display != 0;

    if !found_primary {
        match primary_candidates(connectors, order).first() {
            Some(&idx) => {
                debug!("primary display is {}", connectors[idx].name());
                connectors[idx].set_display(next);
                displays.push(next);
                next += 1;
                found_primary = true;
            }
            None => warn!("no primary display candidate among {order:?}"),
        }
    }

    for conn in connectors.iter_mut() {
        if !(conn.is_internal() || conn.is_external()) || conn.display().is_some() {
            continue;
        }

        if !found_primary {
            debug!("falling back to {} as primary display", conn.name());
            found_primary = true;
        }
        conn.set_display(next);
        displays.push(next);
        next += 1;
    }

    displays
}
