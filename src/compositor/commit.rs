//! Encoding compositions into atomic requests.

use std::io;

use thiserror::Error;
use tracing::{debug, trace};

use super::composition::{CompositionKind, DisplayComposition, PlaneRole};
use crate::kms::{
    AtomicRequest, CommitFlags, CrtcId, KmsDevice, PlaneId, PropertyBlob, PropertyError,
};
use crate::plane::PlaneError;
use crate::resources::ResourceGraph;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("display {display} is not bound to a CRTC")]
    NotBound { display: u32 },
    #[error("unknown {0}")]
    UnknownPlane(PlaneId),
    #[error("planned layer {index} is not part of the frame")]
    MissingLayer { index: usize },
    #[error("{plane} is planned without a layer to show")]
    NoSourceLayer { plane: PlaneId },
    #[error("composited planes need a client target")]
    NoClientTarget,
    #[error("modeset without a mode")]
    NoMode,
    #[error("{connector} is not a writeback connector")]
    NotWriteback { connector: String },
    #[error(transparent)]
    Plane(#[from] PlaneError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("error creating property blob")]
    Blob(#[source] io::Error),
    #[error("commit rejected by the driver")]
    Rejected(#[source] io::Error),
}

/// Writes of one device collected for a single atomic commit.
///
/// Holds the blobs the writes refer to until the request has been committed.
#[derive(Debug, Default)]
pub struct PendingCommit {
    request: AtomicRequest,
    flags: CommitFlags,
    blobs: Vec<PropertyBlob>,
}

impl PendingCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) -> &AtomicRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut AtomicRequest {
        &mut self.request
    }

    pub fn flags(&self) -> CommitFlags {
        self.flags
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }

    /// Keep `blob` alive until this commit is dropped.
    pub fn keep_blob(&mut self, blob: PropertyBlob) {
        self.blobs.push(blob);
    }

    /// Merge another pending commit into this one.
    pub fn merge(&mut self, other: PendingCommit) {
        self.request.merge(other.request);
        self.flags |= other.flags;
        self.blobs.extend(other.blobs);
    }

    /// Submit the writes as one transaction, or only check them with `test_only`.
    pub fn commit(&self, device: &dyn KmsDevice, test_only: bool) -> Result<(), CommitError> {
        let _span = tracy_client::span!("PendingCommit::commit");

        let mut flags = self.flags;
        if test_only {
            flags |= CommitFlags::TEST_ONLY;
        }

        device
            .atomic_commit(flags, &self.request)
            .map_err(CommitError::Rejected)?;

        trace!(
            "committed {} writes with {flags:?} on {}",
            self.request.len(),
            device.name()
        );
        Ok(())
    }
}

/// Stage everything `composition` asks for into `pending`.
///
/// On error `pending` is left untouched.
pub fn encode(
    composition: &DisplayComposition,
    graph: &ResourceGraph,
    pending: &mut PendingCommit,
) -> Result<(), CommitError> {
    let _span = tracy_client::span!("encode");

    let mut staged = PendingCommit::new();
    match composition.kind() {
        CompositionKind::Empty => (),
        CompositionKind::Frame => encode_frame(composition, graph, &mut staged)?,
        CompositionKind::Dpms => encode_dpms(composition, graph, &mut staged)?,
        CompositionKind::Modeset => encode_modeset(composition, graph, &mut staged)?,
    }

    pending.merge(staged);
    Ok(())
}

fn encode_frame(
    composition: &DisplayComposition,
    graph: &ResourceGraph,
    staged: &mut PendingCommit,
) -> Result<(), CommitError> {
    let display = composition.display();
    let crtc = graph
        .crtc(composition.crtc())
        .ok_or(CommitError::NotBound { display })?;

    encode_planes(composition, graph, crtc.id(), staged)?;

    if let Some(target) = composition.writeback() {
        let conn = graph
            .connector(target.connector)
            .ok_or(CommitError::NotBound { display })?;
        let props = conn.writeback_props().ok_or_else(|| CommitError::NotWriteback {
            connector: conn.name(),
        })?;

        conn.crtc_id_property()
            .atomic_set(&mut staged.request, u64::from(crtc.id().0))?;
        props
            .fb_id
            .atomic_set(&mut staged.request, u64::from(target.fb.0))?;
        debug!("display {}: capturing into {}", composition.display(), target.fb);
    }

    Ok(())
}

fn encode_dpms(
    composition: &DisplayComposition,
    graph: &ResourceGraph,
    staged: &mut PendingCommit,
) -> Result<(), CommitError> {
    let display = composition.display();
    let crtc = graph
        .crtc(composition.crtc())
        .ok_or(CommitError::NotBound { display })?;

    // Planes must be off before their CRTC goes inactive.
    encode_planes(composition, graph, crtc.id(), staged)?;

    let mode = composition.dpms_mode();
    crtc.active_property()
        .atomic_set(&mut staged.request, mode.active())?;
    debug!("display {}: power {mode:?}", composition.display());
    Ok(())
}

/// Stage the plan entries, numbering the planes that show something bottom up.
fn encode_planes(
    composition: &DisplayComposition,
    graph: &ResourceGraph,
    crtc: CrtcId,
    staged: &mut PendingCommit,
) -> Result<(), CommitError> {
    let mut zpos = 0;
    for entry in composition.composition_planes() {
        let Some(id) = entry.plane() else {
            trace!("layers {:?} have no plane", entry.source_layers());
            continue;
        };
        let plane = graph.plane(id).ok_or(CommitError::UnknownPlane(id))?;

        match entry.role() {
            PlaneRole::Disable => plane.atomic_disable(&mut staged.request),
            PlaneRole::Layer => {
                let layer = if entry.is_composited() {
                    composition
                        .client_target()
                        .ok_or(CommitError::NoClientTarget)?
                } else {
                    let Some(&index) = entry.source_layers().first() else {
                        return Err(CommitError::NoSourceLayer { plane: id });
                    };
                    composition
                        .layers()
                        .get(index)
                        .ok_or(CommitError::MissingLayer { index })?
                };

                plane.atomic_set_state(&mut staged.request, layer, zpos, crtc)?;
                zpos += 1;
            }
        }
    }

    Ok(())
}

fn encode_modeset(
    composition: &DisplayComposition,
    graph: &ResourceGraph,
    staged: &mut PendingCommit,
) -> Result<(), CommitError> {
    let display = composition.display();
    let crtc = graph
        .crtc(composition.crtc())
        .ok_or(CommitError::NotBound { display })?;
    let conn = graph
        .connector_for_display(display)
        .ok_or(CommitError::NotBound { display })?;
    let mode = composition.display_mode().ok_or(CommitError::NoMode)?;

    let blob = PropertyBlob::for_mode(graph.device(), mode).map_err(CommitError::Blob)?;

    crtc.mode_id_property()
        .atomic_set(&mut staged.request, u64::from(blob.id().0))?;
    crtc.active_property()
        .atomic_set(&mut staged.request, composition.dpms_mode().active())?;
    conn.crtc_id_property()
        .atomic_set(&mut staged.request, u64::from(crtc.id().0))?;

    staged.flags |= CommitFlags::ALLOW_MODESET;
    staged.keep_blob(blob);

    debug!(
        "display {}: modeset {} to {}x{}@{}",
        composition.display(),
        conn.name(),
        mode.hdisplay,
        mode.vdisplay,
        mode.vrefresh
    );
    Ok(())
}
