//! Configuration for the plane planner, written in KDL.
//!
//! ```kdl
//! device "/dev/dri/card%"
//! primary-display-order "eDP-1" "..."
//! scale-with-gpu
//! planner "cost-based"
//! ```

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use miette::{Context, IntoDiagnostic};
use tracing::debug;

/// Device path used when the config names none. A trailing `%` stands for every card index.
pub const DEFAULT_DEVICE: &str = "/dev/dri/card%";

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, unwrap(argument), default = String::from(DEFAULT_DEVICE))]
    pub device: String,
    #[knuffel(child, default)]
    pub primary_display_order: DisplayOrder,
    #[knuffel(child)]
    pub scale_with_gpu: bool,
    #[knuffel(child, unwrap(argument), default)]
    pub planner: PlannerKind,
}

/// Connector names to prefer as the primary display, in order.
///
/// Ending the list with `"..."` lets any other connected connector become primary when none of
/// the listed ones is connected. An empty list behaves like `"..."` alone.
#[derive(knuffel::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayOrder {
    #[knuffel(arguments)]
    pub names: Vec<String>,
}

/// How layers are placed onto hardware planes.
#[derive(knuffel::DecodeScalar, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlannerKind {
    /// Fill overlays from the top layer down, composite the rest.
    #[default]
    Greedy,
    /// Search for the plane assignment that composites the fewest pixels.
    CostBased,
    /// Composite everything onto the primary plane.
    Squash,
}

impl PlannerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlannerKind::Greedy => "greedy",
            PlannerKind::CostBased => "cost-based",
            PlannerKind::Squash => "squash",
        }
    }
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(Self::Greedy),
            "cost-based" => Ok(Self::CostBased),
            "squash" => Ok(Self::Squash),
            _ => Err(format!(
                "unknown planner {s:?}, expected \"greedy\", \"cost-based\" or \"squash\""
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: String::from(DEFAULT_DEVICE),
            primary_display_order: DisplayOrder::default(),
            scale_with_gpu: false,
            planner: PlannerKind::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let _span = tracy_client::span!("Config::load");
        Self::load_internal(path).context("error loading config")
    }

    fn load_internal(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("config.kdl");
        let config = Self::parse(filename, &contents).context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    /// Get the primary display order as plain connector names.
    pub fn display_order(&self) -> &[String] {
        &self.primary_display_order.names
    }
}
