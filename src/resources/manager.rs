//! Every KMS device of the machine, with displays numbered across devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use kmsplan_config::{Config, PlannerKind};
use tracing::{debug, warn};

use super::ResourceGraph;
use crate::kms::KmsDevice;

pub struct ResourceManager {
    graphs: Vec<ResourceGraph>,
    num_displays: u32,
    scale_with_gpu: bool,
    planner: PlannerKind,
}

impl ResourceManager {
    /// Open every device matching the configured path.
    #[cfg(feature = "drm-backend")]
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        Self::with_opener(config, |path| {
            let card = crate::kms::drm::DrmCard::open(path)?;
            Ok(Arc::new(card) as Arc<dyn KmsDevice>)
        })
    }

    /// Open every device matching the configured path through `open`.
    ///
    /// A path ending in `%` is tried with the indices 0, 1, 2 and so on, until a path does not
    /// exist. Devices that fail to open or that cannot drive a display are skipped.
    pub fn with_opener(
        config: &Config,
        mut open: impl FnMut(&Path) -> anyhow::Result<Arc<dyn KmsDevice>>,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("ResourceManager::with_opener");

        let mut devices = Vec::new();
        for path in device_paths(&config.device) {
            match open(&path) {
                Ok(device) => devices.push(device),
                Err(err) => warn!("error opening {path:?}: {err:?}"),
            }
        }

        Self::from_devices(devices, config)
    }

    /// Build the graphs of already opened devices, in order.
    pub fn from_devices(devices: Vec<Arc<dyn KmsDevice>>, config: &Config) -> anyhow::Result<Self> {
        let mut manager = Self {
            graphs: Vec::new(),
            num_displays: 0,
            scale_with_gpu: config.scale_with_gpu,
            planner: config.planner,
        };

        for device in devices {
            if let Err(err) = manager.add_device(device, config.display_order()) {
                warn!("{err:?}");
            }
        }

        if manager.graphs.is_empty() {
            bail!("no usable KMS device found at {:?}", config.device);
        }

        debug!(
            "{} devices, {} displays, planner {}",
            manager.graphs.len(),
            manager.num_displays,
            manager.planner
        );

        Ok(manager)
    }

    fn add_device(&mut self, device: Arc<dyn KmsDevice>, order: &[String]) -> anyhow::Result<()> {
        let name = device.name();
        if !is_kms_device(&*device) {
            debug!("{name} cannot drive displays, skipping");
            return Ok(());
        }

        let graph = ResourceGraph::new(device, order, self.num_displays)
            .with_context(|| format!("error initializing {name}"))?;

        if let Some(last) = graph.displays().last() {
            self.num_displays = last + 1;
        }
        self.graphs.push(graph);
        Ok(())
    }

    // === Core Accessors ===

    pub fn graphs(&self) -> &[ResourceGraph] {
        &self.graphs
    }

    pub fn graphs_mut(&mut self) -> &mut [ResourceGraph] {
        &mut self.graphs
    }

    /// Get the number of display indices handed out so far.
    pub fn num_displays(&self) -> u32 {
        self.num_displays
    }

    pub fn scale_with_gpu(&self) -> bool {
        self.scale_with_gpu
    }

    pub fn planner(&self) -> PlannerKind {
        self.planner
    }

    pub fn graph_for_display(&self, display: u32) -> Option<&ResourceGraph> {
        self.graphs.iter().find(|g| g.handles_display(display))
    }

    pub fn graph_for_display_mut(&mut self, display: u32) -> Option<&mut ResourceGraph> {
        self.graphs.iter_mut().find(|g| g.handles_display(display))
    }
}

/// A device can drive displays when it has at least one CRTC, connector and encoder.
fn is_kms_device(device: &dyn KmsDevice) -> bool {
    match device.resources() {
        Ok(res) => !res.crtcs.is_empty() && !res.connectors.is_empty() && !res.encoders.is_empty(),
        Err(err) => {
            debug!("error getting resources of {}: {err:?}", device.name());
            false
        }
    }
}

/// Expand a device path pattern into the paths to try.
fn device_paths(pattern: &str) -> Vec<PathBuf> {
    let Some(prefix) = pattern.strip_suffix('%') else {
        return vec![PathBuf::from(pattern)];
    };

    let mut paths = Vec::new();
    for idx in 0.. {
        let path = PathBuf::from(format!("{prefix}{idx}"));
        if !path.exists() {
            break;
        }
        paths.push(path);
    }
    paths
}
