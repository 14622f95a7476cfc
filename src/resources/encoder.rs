use crate::kms::{CrtcId, EncoderId};

/// An encoder and the CRTCs that can feed it.
#[derive(Debug, Clone)]
pub struct Encoder {
    id: EncoderId,
    crtc: Option<CrtcId>,
    display: Option<u32>,
    possible_crtcs: Vec<CrtcId>,
    clones: Vec<EncoderId>,
}

impl Encoder {
    pub fn new(id: EncoderId, crtc: Option<CrtcId>, possible_crtcs: Vec<CrtcId>) -> Self {
        Self {
            id,
            crtc,
            display: None,
            possible_crtcs,
            clones: Vec::new(),
        }
    }

    pub fn id(&self) -> EncoderId {
        self.id
    }

    /// Get the CRTC currently feeding this encoder.
    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub fn display(&self) -> Option<u32> {
        self.display
    }

    pub fn possible_crtcs(&self) -> &[CrtcId] {
        &self.possible_crtcs
    }

    pub fn clones(&self) -> &[EncoderId] {
        &self.clones
    }

    pub fn can_clone(&self, other: EncoderId) -> bool {
        self.clones.contains(&other)
    }

    /// Whether the encoder is unused, or already part of `display`'s pipe.
    pub fn can_bind(&self, display: u32) -> bool {
        self.display.map_or(true, |d| d == display)
    }

    pub(super) fn add_clone(&mut self, other: EncoderId) {
        if !self.clones.contains(&other) {
            self.clones.push(other);
        }
    }

    pub(super) fn bind(&mut self, crtc: CrtcId, display: u32) {
        self.crtc = Some(crtc);
        self.display = Some(display);
    }
}
