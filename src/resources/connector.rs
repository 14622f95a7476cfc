use std::io;

use tracing::trace;

use crate::kms::{
    ConnectionState, ConnectorId, ConnectorKind, EncoderId, KmsDevice, ModeInfo, ObjectRef,
    Property, PropertyError, PropertyTable, RawConnector,
};

/// A mode together with an id that stays the same while the connector keeps reporting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    pub id: u32,
    pub info: ModeInfo,
}

/// Writeback-only connector properties.
#[derive(Debug, Clone)]
pub struct WritebackProps {
    pub fb_id: Property,
    pub out_fence_ptr: Property,
    pub pixel_formats: Property,
}

/// A physical or writeback output.
#[derive(Debug, Clone)]
pub struct Connector {
    id: ConnectorId,
    kind: ConnectorKind,
    kind_id: u32,
    state: ConnectionState,
    size_mm: (u32, u32),

    modes: Vec<Mode>,
    preferred_mode: Option<u32>,

    encoders: Vec<EncoderId>,
    encoder: Option<EncoderId>,
    display: Option<u32>,

    crtc_id: Property,
    dpms: Option<Property>,
    writeback: Option<WritebackProps>,
}

impl Connector {
    pub fn new(
        device: &dyn KmsDevice,
        raw: RawConnector,
        next_mode_id: &mut u32,
    ) -> Result<Self, PropertyError> {
        let object = ObjectRef::Connector(raw.id);
        let table = PropertyTable::load(device, object)?;

        let writeback = if raw.kind.is_writeback() {
            Some(WritebackProps {
                fb_id: table.mandatory("WRITEBACK_FB_ID")?,
                out_fence_ptr: table.mandatory("WRITEBACK_OUT_FENCE_PTR")?,
                pixel_formats: table.mandatory("WRITEBACK_PIXEL_FORMATS")?,
            })
        } else {
            None
        };

        let mut conn = Self {
            id: raw.id,
            kind: raw.kind,
            kind_id: raw.kind_id,
            state: raw.state,
            size_mm: raw.size_mm,
            modes: Vec::new(),
            preferred_mode: None,
            encoders: raw.encoders,
            encoder: raw.current_encoder,
            display: None,
            crtc_id: table.mandatory("CRTC_ID")?,
            dpms: table.optional("DPMS"),
            writeback,
        };
        conn.apply_modes(raw.modes, next_mode_id);

        Ok(conn)
    }

    // === Core Accessors ===

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Get the connector name, e.g. `eDP-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.kind_id)
    }

    pub fn kind(&self) -> ConnectorKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn size_mm(&self) -> (u32, u32) {
        self.size_mm
    }

    pub fn is_internal(&self) -> bool {
        self.kind.is_internal()
    }

    pub fn is_external(&self) -> bool {
        self.kind.is_external()
    }

    pub fn is_writeback(&self) -> bool {
        self.kind.is_writeback()
    }

    /// Whether the connector can ever become a display or a writeback target.
    pub fn is_valid_type(&self) -> bool {
        self.is_internal() || self.is_external() || self.is_writeback()
    }

    pub fn encoders(&self) -> &[EncoderId] {
        &self.encoders
    }

    /// Get the encoder bound to this connector.
    pub fn encoder(&self) -> Option<EncoderId> {
        self.encoder
    }

    pub fn display(&self) -> Option<u32> {
        self.display
    }

    pub fn crtc_id_property(&self) -> &Property {
        &self.crtc_id
    }

    pub fn dpms_property(&self) -> Option<&Property> {
        self.dpms.as_ref()
    }

    pub fn writeback_props(&self) -> Option<&WritebackProps> {
        self.writeback.as_ref()
    }

    pub(super) fn set_encoder(&mut self, encoder: EncoderId) {
        self.encoder = Some(encoder);
    }

    pub(super) fn set_display(&mut self, display: u32) {
        self.display = Some(display);
    }

    // === Modes ===

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn mode(&self, id: u32) -> Option<&Mode> {
        self.modes.iter().find(|m| m.id == id)
    }

    /// Get the first mode flagged preferred, or the first mode.
    pub fn preferred_mode(&self) -> Option<&Mode> {
        self.preferred_mode.and_then(|id| self.mode(id))
    }

    /// Re-read the connection state and mode list from the device.
    pub fn update_modes(&mut self, device: &dyn KmsDevice, next_mode_id: &mut u32) -> io::Result<()> {
        let raw = device.connector(self.id)?;
        self.state = raw.state;
        self.apply_modes(raw.modes, next_mode_id);
        Ok(())
    }

    fn apply_modes(&mut self, reported: Vec<ModeInfo>, next_mode_id: &mut u32) {
        let mut preferred = None;
        let mut modes = Vec::with_capacity(reported.len());

        for info in reported {
            let mode = match self.modes.iter().find(|m| m.info.same_timings(&info)) {
                // Keep the id, the mode type may have changed.
                Some(existing) => Mode {
                    id: existing.id,
                    info,
                },
                None => {
                    *next_mode_id += 1;
                    Mode {
                        id: *next_mode_id,
                        info,
                    }
                }
            };

            if preferred.is_none() && mode.info.is_preferred() {
                preferred = Some(mode.id);
            }
            modes.push(mode);
        }

        self.preferred_mode = preferred.or_else(|| modes.first().map(|m| m.id));
        self.modes = modes;

        trace!(
            "{}: {} modes, preferred {:?}",
            self.name(),
            self.modes.len(),
            self.preferred_mode
        );
    }
}
