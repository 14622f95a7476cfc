use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use super::BufferInfo;
use crate::kms::{FramebufferId, KmsDevice};

/// Caches framebuffers per graphics buffer, so a buffer cycling through a swapchain is only
/// imported once.
///
/// Every cached framebuffer is removed from the device when the importer is dropped.
pub struct FbImporter {
    device: Arc<dyn KmsDevice>,
    framebuffers: HashMap<u64, FramebufferId>,
}

impl FbImporter {
    pub fn new(device: &Arc<dyn KmsDevice>) -> Self {
        Self {
            device: device.clone(),
            framebuffers: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, buffer: &BufferInfo) -> io::Result<FramebufferId> {
        if let Some(fb) = self.framebuffers.get(&buffer.id) {
            return Ok(*fb);
        }

        let fb = self.device.add_framebuffer(buffer)?;
        debug!(
            "imported buffer {} ({}x{}) as {fb}",
            buffer.id, buffer.width, buffer.height
        );
        self.framebuffers.insert(buffer.id, fb);
        Ok(fb)
    }

    /// Drop the framebuffer of a buffer the display server no longer uses.
    pub fn retire(&mut self, buffer_id: u64) {
        if let Some(fb) = self.framebuffers.remove(&buffer_id) {
            self.remove(fb);
        }
    }

    /// Remove every cached framebuffer.
    pub fn clear(&mut self) {
        let fbs: Vec<_> = self.framebuffers.drain().map(|(_, fb)| fb).collect();
        for fb in fbs {
            self.remove(fb);
        }
    }

    fn remove(&self, fb: FramebufferId) {
        if let Err(err) = self.device.remove_framebuffer(fb) {
            warn!("error removing {fb}: {err:?}");
        }
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}

impl Drop for FbImporter {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for FbImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FbImporter")
            .field("framebuffers", &self.framebuffers)
            .finish_non_exhaustive()
    }
}
