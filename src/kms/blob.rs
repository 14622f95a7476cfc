use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::warn;

use super::types::{BlobId, ModeInfo};
use super::KmsDevice;

/// A user-created property blob, destroyed when dropped.
pub struct PropertyBlob {
    device: Arc<dyn KmsDevice>,
    id: BlobId,
}

impl PropertyBlob {
    pub fn new(device: &Arc<dyn KmsDevice>, data: &[u8]) -> io::Result<Self> {
        let id = device.create_blob(data)?;
        Ok(Self {
            device: device.clone(),
            id,
        })
    }

    pub fn for_mode(device: &Arc<dyn KmsDevice>, mode: &ModeInfo) -> io::Result<Self> {
        let id = device.create_mode_blob(mode)?;
        Ok(Self {
            device: device.clone(),
            id,
        })
    }

    pub fn id(&self) -> BlobId {
        self.id
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_blob(self.id) {
            warn!("error destroying property blob {}: {err:?}", self.id);
        }
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyBlob").field(&self.id).finish()
    }
}
