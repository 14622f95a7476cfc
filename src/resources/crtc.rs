use std::iter::zip;
use std::sync::Arc;

use anyhow::{ensure, Context};

use crate::kms::{
    AtomicRequest, CrtcId, KmsDevice, ModeInfo, ObjectRef, Property, PropertyBlob, PropertyError,
    PropertyTable, RawCrtc,
};

/// A scanout engine and the display it drives.
#[derive(Debug, Clone)]
pub struct Crtc {
    id: CrtcId,
    /// Position in the device's CRTC list, as used by the possible-CRTC masks.
    pipe: u32,
    mode: Option<ModeInfo>,
    display: Option<u32>,

    active: Property,
    mode_id: Property,
    out_fence_ptr: Option<Property>,
    gamma: Option<GammaProps>,
}

/// Gamma LUT properties of a CRTC.
#[derive(Debug, Clone)]
struct GammaProps {
    gamma_lut: Property,
    gamma_lut_size: u32,
}

impl Crtc {
    pub fn new(device: &dyn KmsDevice, raw: RawCrtc, pipe: u32) -> Result<Self, PropertyError> {
        let table = PropertyTable::load(device, ObjectRef::Crtc(raw.id))?;

        let gamma = match (table.optional("GAMMA_LUT"), table.optional("GAMMA_LUT_SIZE")) {
            (Some(gamma_lut), Some(size)) if size.value() > 0 => Some(GammaProps {
                gamma_lut,
                gamma_lut_size: size.value() as u32,
            }),
            _ => None,
        };

        Ok(Self {
            id: raw.id,
            pipe,
            mode: raw.mode,
            display: None,
            active: table.mandatory("ACTIVE")?,
            mode_id: table.mandatory("MODE_ID")?,
            out_fence_ptr: table.optional("OUT_FENCE_PTR"),
            gamma,
        })
    }

    // === Core Accessors ===

    pub fn id(&self) -> CrtcId {
        self.id
    }

    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Get the mode the CRTC was scanning out when the device was opened.
    pub fn mode(&self) -> Option<&ModeInfo> {
        self.mode.as_ref()
    }

    pub fn display(&self) -> Option<u32> {
        self.display
    }

    pub fn active_property(&self) -> &Property {
        &self.active
    }

    pub fn mode_id_property(&self) -> &Property {
        &self.mode_id
    }

    pub fn out_fence_ptr_property(&self) -> Option<&Property> {
        self.out_fence_ptr.as_ref()
    }

    // === Binding ===

    /// Whether the CRTC is free, or already driving `display`.
    pub fn can_bind(&self, display: u32) -> bool {
        self.display.map_or(true, |d| d == display)
    }

    pub(super) fn set_display(&mut self, display: u32) {
        self.display = Some(display);
    }

    // === Gamma ===

    /// Get the number of entries per channel of the gamma LUT.
    pub fn gamma_size(&self) -> Option<u32> {
        self.gamma.as_ref().map(|g| g.gamma_lut_size)
    }

    /// Stage a new gamma ramp, or the identity ramp for `None`.
    ///
    /// The ramp holds every red entry, then every green, then every blue. The returned blob
    /// must be kept alive until the request is committed.
    pub fn stage_gamma(
        &self,
        device: &Arc<dyn KmsDevice>,
        req: &mut AtomicRequest,
        ramp: Option<&[u16]>,
    ) -> anyhow::Result<Option<PropertyBlob>> {
        let _span = tracy_client::span!("Crtc::stage_gamma");

        let gamma = self.gamma.as_ref().context("setting gamma is not supported")?;

        let blob = if let Some(ramp) = ramp {
            let size = gamma.gamma_lut_size as usize;
            ensure!(ramp.len() == size * 3, "wrong gamma length");

            let (red, rest) = ramp.split_at(size);
            let (green, blue) = rest.split_at(size);

            // struct drm_color_lut: red, green, blue, reserved.
            let mut data = Vec::with_capacity(size * 8);
            for ((r, g), b) in zip(zip(red, green), blue) {
                for v in [*r, *g, *b, 0] {
                    data.extend_from_slice(&v.to_ne_bytes());
                }
            }

            Some(PropertyBlob::new(device, &data).context("error creating gamma blob")?)
        } else {
            None
        };

        let value = blob.as_ref().map_or(0, |b| u64::from(b.id().0));
        gamma
            .gamma_lut
            .atomic_set(req, value)
            .context("error staging GAMMA_LUT")?;

        Ok(blob)
    }
}
