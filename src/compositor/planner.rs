//! Free planes of one commit cycle.

use crate::kms::{PlaneId, PlaneType};
use crate::layer::Layer;
use crate::plane::Plane;
use crate::resources::{Crtc, ResourceGraph};

/// Knobs shared by every placement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Leave every scaled layer to client composition.
    pub scale_with_gpu: bool,
}

/// Planes nobody has claimed yet in the current commit cycle.
///
/// Planning never mutates a pool in place. It borrows one and hands back what is left, so a
/// failed plan leaves the caller's pool as it was.
#[derive(Debug, Clone, Default)]
pub struct PlanePool<'a> {
    primary: Vec<&'a Plane>,
    overlay: Vec<&'a Plane>,
}

impl<'a> PlanePool<'a> {
    /// Sort `planes` into the primary and overlay lists. Cursor planes are never handed out.
    pub fn new(planes: &'a [Plane]) -> Self {
        let mut pool = Self::default();
        for plane in planes {
            match plane.ty() {
                PlaneType::Primary => pool.primary.push(plane),
                PlaneType::Overlay => pool.overlay.push(plane),
                PlaneType::Cursor => (),
            }
        }
        pool
    }

    pub fn from_graph(graph: &'a ResourceGraph) -> Self {
        Self::new(graph.planes())
    }

    // === Core Accessors ===

    pub fn primary(&self) -> &[&'a Plane] {
        &self.primary
    }

    pub fn overlay(&self) -> &[&'a Plane] {
        &self.overlay
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.overlay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.overlay.is_empty()
    }

    pub fn contains(&self, id: PlaneId) -> bool {
        self.primary.iter().chain(&self.overlay).any(|p| p.id() == id)
    }

    pub fn get(&self, id: PlaneId) -> Option<&'a Plane> {
        self.primary
            .iter()
            .chain(&self.overlay)
            .find(|p| p.id() == id)
            .copied()
    }

    /// Get the first free primary plane that can be attached to `crtc`.
    pub fn primary_for(&self, crtc: &Crtc) -> Option<&'a Plane> {
        self.primary.iter().find(|p| p.supports_crtc(crtc)).copied()
    }

    /// Get every free overlay plane that can be attached to `crtc`, in pool order.
    pub fn overlays_for(&self, crtc: &Crtc) -> Vec<&'a Plane> {
        self.overlay
            .iter()
            .filter(|p| p.supports_crtc(crtc))
            .copied()
            .collect()
    }

    /// Take `plane` out of the list its own type puts it in.
    ///
    /// Returns whether the plane was free.
    pub fn remove(&mut self, plane: &Plane) -> bool {
        let list = match plane.ty() {
            PlaneType::Primary => &mut self.primary,
            _ => &mut self.overlay,
        };

        match list.iter().position(|p| p.id() == plane.id()) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Whether `plane` can show `layer` directly while attached to `crtc`.
pub fn can_scan_out(plane: &Plane, layer: &Layer, crtc: &Crtc, options: PlanOptions) -> bool {
    plane.supports_crtc(crtc)
        && layer.is_plane_eligible(options.scale_with_gpu)
        && plane.is_valid_for_layer(layer)
}
