//! Layer placement strategies.
//!
//! A strategy proposes which layers go on which planes; [`DisplayComposition::plan`] applies the
//! proposal to the pool. Every strategy returns entries bottom first, so the position of an
//! entry is the zpos of its plane. Layers that do not get a plane of their own are composited
//! by the client and shown on the primary plane.
//!
//! [`DisplayComposition::plan`]: super::DisplayComposition::plan

use kmsplan_config::PlannerKind;
use tracing::trace;

use super::composition::{CompositionError, CompositionPlane};
use super::planner::{can_scan_out, PlanOptions, PlanePool};
use crate::layer::Layer;
use crate::plane::Plane;
use crate::resources::Crtc;

pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose plane assignments for `layers`, given bottom first with their frame indices.
    fn provision(
        &self,
        layers: &[(usize, &Layer)],
        crtc: &Crtc,
        pool: &PlanePool<'_>,
        options: PlanOptions,
    ) -> Result<Vec<CompositionPlane>, CompositionError>;
}

pub fn strategy_for(kind: PlannerKind) -> Box<dyn PlacementStrategy> {
    match kind {
        PlannerKind::Greedy => Box::new(Greedy),
        PlannerKind::CostBased => Box::new(CostBased),
        PlannerKind::Squash => Box::new(Squash),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn primary_plane<'a>(pool: &PlanePool<'a>, crtc: &Crtc) -> Result<&'a Plane, CompositionError> {
    pool.primary_for(crtc)
        .ok_or(CompositionError::NoPrimaryPlane { crtc: crtc.id() })
}

/// Fail if any of `layers` must not be composited by the client.
fn check_composable(layers: &[(usize, &Layer)]) -> Result<(), CompositionError> {
    match layers.iter().find(|(_, layer)| layer.protected) {
        Some(&(layer, _)) => Err(CompositionError::Allocation { layer }),
        None => Ok(()),
    }
}

/// Entry for the bottom `layers`: shown directly when it is a single layer the primary plane
/// can take, composited otherwise.
fn primary_entry(
    primary: &Plane,
    layers: &[(usize, &Layer)],
    crtc: &Crtc,
    options: PlanOptions,
) -> Result<CompositionPlane, CompositionError> {
    if let [(index, layer)] = layers {
        if can_scan_out(primary, layer, crtc, options) {
            return Ok(CompositionPlane::direct(primary.id(), crtc.id(), *index));
        }
    }

    check_composable(layers)?;
    Ok(CompositionPlane::composited(
        primary.id(),
        crtc.id(),
        layers.iter().map(|(index, _)| *index).collect(),
    ))
}

/// Client-composited pixels of `layers`.
fn client_cost(layers: &[(usize, &Layer)]) -> u64 {
    layers.iter().map(|(_, l)| l.display_frame.area()).sum()
}

// =============================================================================
// Greedy
// =============================================================================

/// Fill overlays from the top layer down until a layer does not fit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greedy;

impl PlacementStrategy for Greedy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn provision(
        &self,
        layers: &[(usize, &Layer)],
        crtc: &Crtc,
        pool: &PlanePool<'_>,
        options: PlanOptions,
    ) -> Result<Vec<CompositionPlane>, CompositionError> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }

        let primary = primary_plane(pool, crtc)?;
        let mut overlays = pool.overlays_for(crtc);

        // Layers [..split] end up on the primary plane.
        let mut split = 1;
        let mut placed = Vec::new();
        for pos in (1..layers.len()).rev() {
            let (index, layer) = layers[pos];
            match overlays
                .iter()
                .position(|p| can_scan_out(p, layer, crtc, options))
            {
                Some(i) => {
                    let plane = overlays.remove(i);
                    placed.push(CompositionPlane::direct(plane.id(), crtc.id(), index));
                }
                None => {
                    trace!("layer {index} does not fit any overlay");
                    split = pos + 1;
                    break;
                }
            }
        }

        let mut entries = vec![primary_entry(primary, &layers[..split], crtc, options)?];
        entries.extend(placed.into_iter().rev());
        Ok(entries)
    }
}

// =============================================================================
// Cost-based
// =============================================================================

/// Try every split between client composition and overlays and keep the cheapest one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CostBased;

impl CostBased {
    /// Match every layer to its own overlay, or return `None`.
    ///
    /// Augmenting-path bipartite matching; the result holds the overlay index per layer.
    fn match_overlays(
        layers: &[(usize, &Layer)],
        overlays: &[&Plane],
        crtc: &Crtc,
        options: PlanOptions,
    ) -> Option<Vec<usize>> {
        if layers.len() > overlays.len() {
            return None;
        }

        let fits: Vec<Vec<usize>> = layers
            .iter()
            .map(|(_, layer)| {
                (0..overlays.len())
                    .filter(|&o| can_scan_out(overlays[o], layer, crtc, options))
                    .collect()
            })
            .collect();

        fn augment(
            layer: usize,
            fits: &[Vec<usize>],
            seen: &mut [bool],
            owner: &mut [Option<usize>],
        ) -> bool {
            for &o in &fits[layer] {
                if seen[o] {
                    continue;
                }
                seen[o] = true;
                if owner[o].map_or(true, |other| augment(other, fits, seen, owner)) {
                    owner[o] = Some(layer);
                    return true;
                }
            }
            false
        }

        let mut owner = vec![None; overlays.len()];
        for layer in 0..layers.len() {
            let mut seen = vec![false; overlays.len()];
            if !augment(layer, &fits, &mut seen, &mut owner) {
                return None;
            }
        }

        let mut assignment = vec![0; layers.len()];
        for (o, layer) in owner.iter().enumerate() {
            if let Some(layer) = layer {
                assignment[*layer] = o;
            }
        }
        Some(assignment)
    }
}

impl PlacementStrategy for CostBased {
    fn name(&self) -> &'static str {
        "cost-based"
    }

    fn provision(
        &self,
        layers: &[(usize, &Layer)],
        crtc: &Crtc,
        pool: &PlanePool<'_>,
        options: PlanOptions,
    ) -> Result<Vec<CompositionPlane>, CompositionError> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }

        let primary = primary_plane(pool, crtc)?;
        let overlays = pool.overlays_for(crtc);

        // (client pixels, planes used, split, overlay per layer above the split)
        let mut best: Option<(u64, usize, usize, Vec<usize>)> = None;
        let mut first_err = None;

        for split in 0..=layers.len() {
            let top = if split == 0 {
                if !can_scan_out(primary, layers[0].1, crtc, options) {
                    continue;
                }
                &layers[1..]
            } else {
                // Every larger split composites the same protected layer.
                if let Err(err) = check_composable(&layers[..split]) {
                    first_err = Some(err);
                    break;
                }
                &layers[split..]
            };

            let Some(assignment) = Self::match_overlays(top, &overlays, crtc, options) else {
                continue;
            };

            let cost = if split == 0 {
                0
            } else {
                client_cost(&layers[..split])
            };
            let planes = 1 + top.len();
            let better = best
                .as_ref()
                .map_or(true, |(c, p, _, _)| (cost, planes) < (*c, *p));
            if better {
                best = Some((cost, planes, split, assignment));
            }
        }

        let Some((cost, _, split, assignment)) = best else {
            return Err(first_err.unwrap_or(CompositionError::Allocation {
                layer: layers[0].0,
            }));
        };
        trace!("cheapest split is {split} with {cost} client pixels");

        let bottom_len = split.max(1);
        let mut entries = Vec::with_capacity(1 + layers.len() - bottom_len);
        entries.push(if split == 0 {
            CompositionPlane::direct(primary.id(), crtc.id(), layers[0].0)
        } else {
            CompositionPlane::composited(
                primary.id(),
                crtc.id(),
                layers[..split].iter().map(|(index, _)| *index).collect(),
            )
        });

        for ((index, _), overlay) in layers[bottom_len..].iter().zip(assignment) {
            entries.push(CompositionPlane::direct(
                overlays[overlay].id(),
                crtc.id(),
                *index,
            ));
        }

        Ok(entries)
    }
}

// =============================================================================
// Squash
// =============================================================================

/// Show everything on the primary plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct Squash;

impl PlacementStrategy for Squash {
    fn name(&self) -> &'static str {
        "squash"
    }

    fn provision(
        &self,
        layers: &[(usize, &Layer)],
        crtc: &Crtc,
        pool: &PlanePool<'_>,
        options: PlanOptions,
    ) -> Result<Vec<CompositionPlane>, CompositionError> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }

        let primary = primary_plane(pool, crtc)?;
        Ok(vec![primary_entry(primary, layers, crtc, options)?])
    }
}

// =============================================================================
// Client only
// =============================================================================

/// Composite every layer on the client, for retrying a frame the driver rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientOnly;

impl PlacementStrategy for ClientOnly {
    fn name(&self) -> &'static str {
        "client-only"
    }

    fn provision(
        &self,
        layers: &[(usize, &Layer)],
        crtc: &Crtc,
        pool: &PlanePool<'_>,
        _options: PlanOptions,
    ) -> Result<Vec<CompositionPlane>, CompositionError> {
        if layers.is_empty() {
            return Ok(Vec::new());
        }

        let primary = primary_plane(pool, crtc)?;
        check_composable(layers)?;
        Ok(vec![CompositionPlane::composited(
            primary.id(),
            crtc.id(),
            layers.iter().map(|(index, _)| *index).collect(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use insta::assert_debug_snapshot;

    use super::*;
    use crate::kms::virt::{HardwareDesc, PlaneDesc, VirtualDevice};
    use crate::kms::{FramebufferId, KmsDevice};
    use crate::layer::{format, BufferInfo, Rect, Transform};
    use crate::resources::ResourceGraph;

    fn graph(planes: Vec<PlaneDesc>) -> ResourceGraph {
        let device: Arc<dyn KmsDevice> =
            Arc::new(VirtualDevice::new(HardwareDesc::single_display(planes)));
        ResourceGraph::new(device, &[], 0).unwrap()
    }

    fn layer(format: u32, size: i32) -> Layer {
        let buffer = BufferInfo {
            id: 1,
            width: size as u32,
            height: size as u32,
            format,
            pitches: [size as u32 * 4, 0, 0, 0],
            offsets: [0; 4],
            handles: [1, 0, 0, 0],
            modifiers: [0; 4],
        };
        let mut layer = Layer::new(buffer, Rect::from_size(size, size));
        layer.fb = Some(FramebufferId(201));
        layer
    }

    fn provision(
        strategy: &dyn PlacementStrategy,
        g: &ResourceGraph,
        layers: &[Layer],
    ) -> Result<Vec<CompositionPlane>, CompositionError> {
        let pool = PlanePool::from_graph(g);
        let indexed: Vec<(usize, &Layer)> = layers.iter().enumerate().collect();
        strategy.provision(&indexed, &g.crtcs()[0], &pool, PlanOptions::default())
    }

    /// (plane index in the graph, source layers, composited)
    fn summary(g: &ResourceGraph, planes: &[CompositionPlane]) -> Vec<(usize, Vec<usize>, bool)> {
        planes
            .iter()
            .map(|p| {
                let idx = g
                    .planes()
                    .iter()
                    .position(|gp| Some(gp.id()) == p.plane())
                    .unwrap();
                (idx, p.source_layers().to_vec(), p.is_composited())
            })
            .collect()
    }

    #[test]
    fn greedy_places_top_layers_on_overlays() {
        let g = graph(vec![
            PlaneDesc::primary(&["XR24"]),
            PlaneDesc::overlay(&["XR24"]),
            PlaneDesc::overlay(&["XR24"]),
        ]);
        let layers = vec![layer(format::XRGB8888, 64); 3];

        let planes = provision(&Greedy, &g, &layers).unwrap();
        assert_debug_snapshot!(summary(&g, &planes), @r"
        [
            (
                0,
                [
                    0,
                ],
                false,
            ),
            (
                2,
                [
                    1,
                ],
                false,
            ),
            (
                1,
                [
                    2,
                ],
                false,
            ),
        ]
        ");
    }

    #[test]
    fn greedy_composites_below_the_first_misfit() {
        let g = graph(vec![
            PlaneDesc::primary(&["XR24"]),
            PlaneDesc::overlay(&["XR24"]),
            PlaneDesc::overlay(&["XR24"]),
        ]);
        let layers = vec![
            layer(format::XRGB8888, 64),
            layer(format::XRGB8888, 64),
            layer(format::NV12, 64),
            layer(format::XRGB8888, 64),
        ];

        let planes = provision(&Greedy, &g, &layers).unwrap();
        assert_eq!(
            summary(&g, &planes),
            [(0, vec![0, 1, 2], true), (1, vec![3], false)]
        );
    }

    #[test]
    fn cost_based_skips_a_misfit_in_the_middle() {
        // The NV12 overlay only fits the middle layer, greedy would give it to the top one.
        let g = graph(vec![
            PlaneDesc::primary(&["XR24"]),
            PlaneDesc::overlay(&["XR24", "NV12"]),
            PlaneDesc::overlay(&["XR24"]),
        ]);
        let layers = vec![
            layer(format::XRGB8888, 256),
            layer(format::NV12, 128),
            layer(format::XRGB8888, 64),
        ];

        let greedy = provision(&Greedy, &g, &layers).unwrap();
        assert_eq!(
            summary(&g, &greedy),
            [(0, vec![0, 1], true), (1, vec![2], false)]
        );

        let cost_based = provision(&CostBased, &g, &layers).unwrap();
        assert_eq!(
            summary(&g, &cost_based),
            [(0, vec![0], false), (1, vec![1], false), (2, vec![2], false)]
        );
    }

    #[test]
    fn cost_based_prefers_fewer_client_pixels() {
        let g = graph(vec![PlaneDesc::primary(&["XR24"]), PlaneDesc::overlay(&["XR24"])]);
        // Three layers, two planes: composite the two cheapest bottom layers.
        let layers = vec![
            layer(format::XRGB8888, 16),
            layer(format::XRGB8888, 16),
            layer(format::XRGB8888, 512),
        ];

        let planes = provision(&CostBased, &g, &layers).unwrap();
        assert_eq!(
            summary(&g, &planes),
            [(0, vec![0, 1], true), (1, vec![2], false)]
        );
    }

    #[test]
    fn squash_uses_one_plane() {
        let g = graph(vec![PlaneDesc::primary(&["XR24"]), PlaneDesc::overlay(&["XR24"])]);

        let single = provision(&Squash, &g, &[layer(format::XRGB8888, 64)]).unwrap();
        assert_eq!(summary(&g, &single), [(0, vec![0], false)]);

        let layers = vec![layer(format::XRGB8888, 64); 2];
        let planes = provision(&Squash, &g, &layers).unwrap();
        assert_eq!(summary(&g, &planes), [(0, vec![0, 1], true)]);
    }

    #[test]
    fn protected_layers_are_never_composited() {
        let g = graph(vec![PlaneDesc::primary(&["XR24"])]);
        let mut protected = layer(format::XRGB8888, 64);
        protected.protected = true;
        protected.transform = Transform::ROTATE_90 | Transform::FLIP_H;
        let layers = vec![layer(format::XRGB8888, 64), protected];

        for strategy in [&Greedy as &dyn PlacementStrategy, &CostBased, &Squash, &ClientOnly] {
            let err = provision(strategy, &g, &layers).unwrap_err();
            assert!(
                matches!(err, CompositionError::Allocation { layer: 1 }),
                "{}: {err:?}",
                strategy.name()
            );
        }
    }

    #[test]
    fn layers_need_a_primary_plane() {
        let g = graph(vec![PlaneDesc::overlay(&["XR24"])]);
        let err = provision(&Greedy, &g, &[layer(format::XRGB8888, 64)]).unwrap_err();
        assert!(matches!(err, CompositionError::NoPrimaryPlane { .. }));

        assert!(provision(&Greedy, &g, &[]).unwrap().is_empty());
    }

    #[test]
    fn scaled_layers_go_to_the_client_with_scale_with_gpu() {
        let g = graph(vec![PlaneDesc::primary(&["XR24"]), PlaneDesc::overlay(&["XR24"])]);
        let mut scaled = layer(format::XRGB8888, 64);
        scaled.display_frame = Rect::from_size(128, 128);
        let layers = vec![layer(format::XRGB8888, 64), scaled];

        let pool = PlanePool::from_graph(&g);
        let indexed: Vec<(usize, &Layer)> = layers.iter().enumerate().collect();
        let options = PlanOptions {
            scale_with_gpu: true,
        };
        let planes = Greedy
            .provision(&indexed, &g.crtcs()[0], &pool, options)
            .unwrap();
        assert_eq!(summary(&g, &planes), [(0, vec![0, 1], true)]);
    }
}
