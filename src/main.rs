use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use kmsplan::compositor::{commit_frame, DisplayPipeline, PlanOptions};
use kmsplan::kms::virt::{HardwareDesc, VirtualDevice};
use kmsplan::kms::KmsDevice;
use kmsplan::resources::ResourceManager;
use kmsplan::scene::Scene;
use kmsplan_config::{Config, PlannerKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "kmsplan=debug";

#[derive(Parser)]
#[command(name = "kmsplan", version)]
#[command(about = "Plan layers onto KMS hardware planes")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and commit a scene on a virtual device
    Simulate {
        /// Hardware description JSON.
        #[arg(long)]
        hardware: PathBuf,
        /// Scene JSON with the frames to commit.
        #[arg(long)]
        scene: PathBuf,
        /// Override the configured planner.
        #[arg(long)]
        planner: Option<PlannerKind>,
        /// Print every commit the device received.
        #[arg(long)]
        dump_commits: bool,
    },
    /// List the displays and planes of the KMS devices
    #[cfg(feature = "drm-backend")]
    Probe,
    /// Check the config file for errors
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig => {
            let Some(path) = &cli.config else {
                info!("no config file given, the defaults are valid");
                return Ok(());
            };
            Config::load(path).map_err(|err| anyhow!("{err:?}"))?;
            info!("config is valid");
            Ok(())
        }
        Command::Simulate {
            hardware,
            scene,
            planner,
            dump_commits,
        } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(planner) = planner {
                config.planner = planner;
            }
            simulate(&config, &hardware, &scene, dump_commits)
        }
        #[cfg(feature = "drm-backend")]
        Command::Probe => probe(&load_config(cli.config.as_deref())),
    }
}

fn load_config(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };

    match Config::load(path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{err:?}");
            warn!("using the default config");
            Config::default()
        }
    }
}

fn simulate(config: &Config, hardware: &Path, scene: &Path, dump_commits: bool) -> anyhow::Result<()> {
    let _span = tracy_client::span!("simulate");

    let text = fs::read_to_string(hardware)
        .with_context(|| format!("error reading {hardware:?}"))?;
    let desc = HardwareDesc::from_json(&text).context("error parsing hardware description")?;
    let device = Arc::new(VirtualDevice::new(desc));

    let text = fs::read_to_string(scene).with_context(|| format!("error reading {scene:?}"))?;
    let scene = Scene::from_json(&text).context("error parsing scene")?;
    let frames = scene.display_frames()?;

    let manager =
        ResourceManager::from_devices(vec![device.clone() as Arc<dyn KmsDevice>], config)?;
    let graph = &manager.graphs()[0];

    let options = PlanOptions {
        scale_with_gpu: manager.scale_with_gpu(),
    };
    let mut pipelines = Vec::new();
    for &id in graph.displays() {
        let Ok(mut pipeline) = DisplayPipeline::new(graph, id, manager.planner(), options) else {
            warn!("display {id} has no CRTC, skipping");
            continue;
        };
        if let Err(err) = pipeline.choose_preferred_mode(graph) {
            warn!("display {id}: {err:?}");
        }
        pipelines.push(pipeline);
    }

    for (i, frame) in frames.iter().enumerate() {
        let report = commit_frame(graph, &mut pipelines, frame)
            .with_context(|| format!("error committing frame {i}"))?;
        println!("{}", serde_json::to_string(&report)?);
    }

    for pipeline in &pipelines {
        info!(
            "display {}: {}",
            pipeline.display(),
            serde_json::to_string(&pipeline.stats())?
        );
    }

    if dump_commits {
        for commit in device.commits() {
            println!("{:?} accepted={}", commit.flags, commit.accepted);
            for write in commit.request.writes() {
                println!("  {} {} = {}", write.object, write.name, write.value);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "drm-backend")]
fn probe(config: &Config) -> anyhow::Result<()> {
    let manager = ResourceManager::open(config)?;

    for graph in manager.graphs() {
        println!("{}:", graph.device().name());
        for &display in graph.displays() {
            let Some(conn) = graph.connector_for_display(display) else {
                continue;
            };
            let crtc = graph
                .crtc_for_display(display)
                .map_or_else(|| String::from("unbound"), |c| c.id().to_string());
            println!("  display {display}: {} on {crtc}", conn.name());
            for mode in conn.modes() {
                let (w, h) = mode.info.size();
                println!("    mode {}: {w}x{h}@{}", mode.id, mode.info.vrefresh);
            }
        }
        for plane in graph.planes() {
            println!(
                "  {} {:?}: {} formats",
                plane.id(),
                plane.ty(),
                plane.formats().len()
            );
        }
    }

    Ok(())
}
