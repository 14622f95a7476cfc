//! One frame across every display of a device, committed at once.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::commit::{CommitError, PendingCommit};
use super::composition::CompositionError;
use super::display::DisplayPipeline;
use super::planner::PlanePool;
use crate::kms::PlaneId;
use crate::layer::Layer;
use crate::resources::ResourceGraph;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("display {0} has no pipeline")]
    UnknownDisplay(u32),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Layers of one display for the next frame, bottom first.
#[derive(Debug, Clone, Default)]
pub struct DisplayFrame {
    pub display: u32,
    pub layers: Vec<Layer>,
    /// Buffer the client composites into, shown by planes marked composited.
    pub client_target: Option<Layer>,
}

/// Outcome of one display in a committed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayReport {
    pub display: u32,
    pub planes: Vec<PlaneId>,
    pub client_layers: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub displays: Vec<DisplayReport>,
    /// The driver rejected the planned frame and every layer went to the client.
    pub client_fallback: bool,
}

/// Plan, encode and commit `frames` on the displays of `graph` as one transaction.
///
/// Displays are planned in the order of `frames`, each from the planes the earlier ones left
/// over. If the driver rejects the result in a test commit, the whole frame is planned again
/// with every layer composited by the client.
pub fn commit_frame(
    graph: &ResourceGraph,
    pipelines: &mut [DisplayPipeline],
    frames: &[DisplayFrame],
) -> Result<FrameReport, FrameError> {
    let _span = tracy_client::span!("commit_frame");

    for frame in frames {
        if !pipelines.iter().any(|p| p.display() == frame.display) {
            return Err(FrameError::UnknownDisplay(frame.display));
        }
    }

    let mut client_fallback = false;
    plan(graph, pipelines, frames, false)?;
    let mut pending = encode_all(graph, pipelines, frames)?;

    if let Err(err) = pending.commit(&**graph.device(), true) {
        warn!("driver rejected the planned frame, retrying with client composition: {err}");
        for pipeline in pipelines.iter_mut() {
            if frames.iter().any(|f| f.display == pipeline.display()) {
                pipeline.record_failed_present();
            }
        }

        plan(graph, pipelines, frames, true)?;
        pending = encode_all(graph, pipelines, frames)?;
        pending.commit(&**graph.device(), true)?;
        client_fallback = true;
    }

    pending.commit(&**graph.device(), false)?;

    let mut displays = Vec::with_capacity(frames.len());
    for frame in frames {
        if let Some(pipeline) = pipelines.iter_mut().find(|p| p.display() == frame.display) {
            pipeline.committed();
            displays.push(DisplayReport {
                display: frame.display,
                planes: pipeline.lit_planes().to_vec(),
                client_layers: pipeline.client_layers(),
            });
        }
    }

    debug!(
        "committed {} displays with {} writes",
        displays.len(),
        pending.request().len()
    );

    Ok(FrameReport {
        displays,
        client_fallback,
    })
}

fn plan(
    graph: &ResourceGraph,
    pipelines: &mut [DisplayPipeline],
    frames: &[DisplayFrame],
    client_only: bool,
) -> Result<(), CompositionError> {
    let mut pool = PlanePool::from_graph(graph);

    // Displays sitting this frame out keep scanning out their planes.
    for pipeline in pipelines.iter() {
        if frames.iter().any(|f| f.display == pipeline.display()) {
            continue;
        }
        for &id in pipeline.lit_planes() {
            if let Some(plane) = graph.plane(id) {
                pool.remove(plane);
            }
        }
    }

    for frame in frames {
        let Some(pipeline) = pipelines.iter_mut().find(|p| p.display() == frame.display) else {
            continue;
        };

        let layers = frame.layers.clone();
        let target = frame.client_target.clone();
        pool = if client_only {
            pipeline.validate_client_only(graph, layers, target, &pool)?
        } else {
            pipeline.validate(graph, layers, target, &pool)?
        };
    }

    Ok(())
}

fn encode_all(
    graph: &ResourceGraph,
    pipelines: &[DisplayPipeline],
    frames: &[DisplayFrame],
) -> Result<PendingCommit, CommitError> {
    let mut pending = PendingCommit::new();
    for frame in frames {
        if let Some(pipeline) = pipelines.iter().find(|p| p.display() == frame.display) {
            pipeline.encode_into(graph, &mut pending)?;
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kmsplan_config::PlannerKind;

    use super::*;
    use crate::compositor::planner::PlanOptions;
    use crate::kms::virt::{HardwareDesc, VirtualDevice};
    use crate::kms::{CommitFlags, KmsDevice, ObjectRef};
    use crate::layer::{format, BufferInfo, Rect};

    const TWO_DISPLAYS: &str = r#"{
        "crtcs": [{}, {}],
        "encoders": [
            { "possible_crtcs": [0] },
            { "possible_crtcs": [1] }
        ],
        "connectors": [
            { "kind": "eDP", "encoders": [0] },
            { "kind": "HDMI-A", "encoders": [1] }
        ],
        "planes": [
            { "type": "primary", "formats": ["XR24"], "possible_crtcs": [0] },
            { "type": "primary", "formats": ["XR24"], "possible_crtcs": [1] },
            { "type": "overlay", "formats": ["XR24"], "possible_crtcs": [0, 1] }
        ]
    }"#;

    fn setup(desc: HardwareDesc) -> (Arc<VirtualDevice>, ResourceGraph, Vec<DisplayPipeline>) {
        let dev = Arc::new(VirtualDevice::new(desc));
        let device: Arc<dyn KmsDevice> = dev.clone();
        let graph = ResourceGraph::new(device, &[], 0).unwrap();
        let pipelines = graph
            .displays()
            .iter()
            .map(|&d| {
                DisplayPipeline::new(&graph, d, PlannerKind::Greedy, PlanOptions::default())
                    .unwrap()
            })
            .collect();
        (dev, graph, pipelines)
    }

    fn layer(id: u64) -> Layer {
        let buffer = BufferInfo {
            id,
            width: 256,
            height: 256,
            format: format::XRGB8888,
            pitches: [1024, 0, 0, 0],
            offsets: [0; 4],
            handles: [id as u32, 0, 0, 0],
            modifiers: [0; 4],
        };
        Layer::new(buffer, Rect::from_size(256, 256))
    }

    fn frame(display: u32, first_id: u64) -> DisplayFrame {
        DisplayFrame {
            display,
            layers: vec![layer(first_id), layer(first_id + 1)],
            client_target: Some(layer(first_id + 100)),
        }
    }

    #[test]
    fn displays_share_one_commit() {
        let (dev, graph, mut pipelines) =
            setup(HardwareDesc::from_json(TWO_DISPLAYS).unwrap());

        let report = commit_frame(&graph, &mut pipelines, &[frame(0, 1), frame(1, 10)]).unwrap();
        assert!(!report.client_fallback);

        // The first display takes the shared overlay.
        assert_eq!(report.displays[0].planes.len(), 2);
        assert!(report.displays[0].client_layers.is_empty());
        assert_eq!(report.displays[1].planes.len(), 1);
        assert_eq!(report.displays[1].client_layers, [0, 1]);

        let flags: Vec<_> = dev.commits().iter().map(|c| c.flags).collect();
        assert_eq!(flags, [CommitFlags::TEST_ONLY, CommitFlags::empty()]);
    }

    #[test]
    fn rejected_frame_falls_back_to_client() {
        let mut desc = HardwareDesc::from_json(TWO_DISPLAYS).unwrap();
        desc.max_active_planes = Some(2);
        let (dev, graph, mut pipelines) = setup(desc);

        let report = commit_frame(&graph, &mut pipelines, &[frame(0, 1), frame(1, 10)]).unwrap();
        assert!(report.client_fallback);
        for display in &report.displays {
            assert_eq!(display.planes.len(), 1);
            assert_eq!(display.client_layers, [0, 1]);
        }

        let accepted: Vec<_> = dev.commits().iter().map(|c| c.accepted).collect();
        assert_eq!(accepted, [false, true, true]);
        assert_eq!(pipelines[0].stats().failed_present, 1);
        assert_eq!(pipelines[0].stats().frames, 1);
    }

    #[test]
    fn idle_display_overlay_is_free_to_take() {
        let (_dev, graph, mut pipelines) =
            setup(HardwareDesc::from_json(TWO_DISPLAYS).unwrap());

        // Display 0 never lit the overlay, so display 1 may take it alone.
        let report = commit_frame(&graph, &mut pipelines, &[frame(1, 10)]).unwrap();
        assert_eq!(report.displays.len(), 1);
        assert_eq!(report.displays[0].planes.len(), 2);
    }

    #[test]
    fn unplanned_display_keeps_its_planes() {
        let (dev, graph, mut pipelines) =
            setup(HardwareDesc::from_json(TWO_DISPLAYS).unwrap());
        let overlay = graph.planes()[2].id();

        let report = commit_frame(&graph, &mut pipelines, &[frame(0, 1)]).unwrap();
        assert!(report.displays[0].planes.contains(&overlay));

        // Display 0 is still scanning out the overlay.
        let report = commit_frame(&graph, &mut pipelines, &[frame(1, 10)]).unwrap();
        assert!(!report.displays[0].planes.contains(&overlay));
        assert_eq!(report.displays[0].client_layers, [0, 1]);
        assert!(pipelines[0].lit_planes().contains(&overlay));

        let last = dev.commits().last().unwrap().clone();
        assert!(last.request.writes_for(ObjectRef::Plane(overlay)).next().is_none());

        // Once display 0 lets go of it in the same commit, it is free on the next one.
        let mut small = frame(0, 20);
        small.layers.truncate(1);
        commit_frame(&graph, &mut pipelines, &[small, frame(1, 30)]).unwrap();
        assert!(!pipelines[0].lit_planes().contains(&overlay));
        assert!(!pipelines[1].lit_planes().contains(&overlay));

        let report = commit_frame(&graph, &mut pipelines, &[frame(1, 40)]).unwrap();
        assert!(report.displays[0].planes.contains(&overlay));
    }

    #[test]
    fn unknown_display_is_an_error() {
        let (dev, graph, mut pipelines) =
            setup(HardwareDesc::from_json(TWO_DISPLAYS).unwrap());

        let err = commit_frame(&graph, &mut pipelines, &[frame(7, 1)]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownDisplay(7)));
        assert!(dev.commits().is_empty());
    }

    #[test]
    fn driver_failure_leaves_state_untouched() {
        let mut desc = HardwareDesc::from_json(TWO_DISPLAYS).unwrap();
        desc.reject_commits = true;
        let (_dev, graph, mut pipelines) = setup(desc);

        let err = commit_frame(&graph, &mut pipelines, &[frame(0, 1)]).unwrap_err();
        assert!(matches!(err, FrameError::Commit(CommitError::Rejected(_))));
        assert!(pipelines[0].lit_planes().is_empty());
        assert_eq!(pipelines[0].stats().frames, 0);
    }
}
