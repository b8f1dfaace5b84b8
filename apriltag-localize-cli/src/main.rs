use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use apriltag_pose::{
    AprilTagDetection, AprilTagField, CameraLocalizer, CameraParameters, LocalizationStrategy,
    LowestAmbiguityStrategy, MultiTagPnpStrategy, PnpMethod, Transform,
};

/// AprilTag localization CLI: camera pose from tag detections on a known field
#[derive(Parser)]
#[command(name = "apriltag-localize", version)]
struct Args {
    /// Field layout (JSON or TOML)
    #[arg(long)]
    field: PathBuf,

    /// Camera intrinsics and distortion (JSON or TOML)
    #[arg(long, conflicts_with = "camera_preset", required_unless_present = "camera_preset")]
    camera: Option<PathBuf>,

    /// Built-in camera calibration, e.g. depstech or logitech-c920
    #[arg(long)]
    camera_preset: Option<String>,

    /// Detections JSON: an array, or an object with a `detections` array.
    /// Use `-` for stdin.
    #[arg(long, default_value = "-")]
    detections: String,

    /// Localization strategy
    #[arg(short, long, value_enum, default_value_t = StrategyArg::MultiTagPnp)]
    strategy: StrategyArg,

    /// PnP method for the strategy (iterative, ap3p, ippe, sqpnp)
    #[arg(short, long)]
    method: Option<PnpMethod>,

    /// PnP method of the lowest-ambiguity fallback used by multi-tag-pnp
    #[arg(long, default_value = "ippe")]
    fallback_method: PnpMethod,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,

    /// Suppress non-JSON output
    #[arg(short, long)]
    quiet: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    LowestAmbiguity,
    MultiTagPnp,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectionsInput {
    List(Vec<AprilTagDetection>),
    Report { detections: Vec<AprilTagDetection> },
}

#[derive(Serialize)]
struct Output {
    strategy: String,
    world_in_camera: Option<Transform>,
    camera_in_world: Option<Transform>,
    detections_used: Vec<u32>,
}

fn init_logging(args: &Args) {
    let level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn load_camera(args: &Args) -> Result<CameraParameters> {
    if let Some(name) = &args.camera_preset {
        return CameraParameters::preset(name)
            .with_context(|| format!("unknown camera preset: {name}"));
    }
    let Some(path) = &args.camera else {
        bail!("either --camera or --camera-preset is required");
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read camera file: {}", path.display()))?;
    let camera = match extension(path).as_str() {
        "json" => serde_json::from_str(&text)?,
        "toml" => toml::from_str(&text)?,
        other => bail!("unsupported camera file extension: {other:?}"),
    };
    Ok(camera)
}

fn load_detections(source: &str) -> Result<Vec<AprilTagDetection>> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read detections from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read detections: {source}"))?
    };
    let input: DetectionsInput = serde_json::from_str(&text).context("invalid detections JSON")?;
    Ok(match input {
        DetectionsInput::List(detections) => detections,
        DetectionsInput::Report { detections } => detections,
    })
}

fn build_strategy(args: &Args) -> Result<Box<dyn LocalizationStrategy>> {
    Ok(match args.strategy {
        StrategyArg::LowestAmbiguity => Box::new(LowestAmbiguityStrategy::new(
            args.method.unwrap_or(PnpMethod::Ippe),
        )),
        StrategyArg::MultiTagPnp => {
            let fallback = LowestAmbiguityStrategy::new(args.fallback_method);
            Box::new(
                MultiTagPnpStrategy::new(args.method.unwrap_or(PnpMethod::Sqpnp))?
                    .with_fallback(Box::new(fallback))?,
            )
        }
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let field = AprilTagField::from_path(&args.field)
        .with_context(|| format!("failed to load field: {}", args.field.display()))?;
    let camera = load_camera(&args)?;
    let strategy = build_strategy(&args)?;
    let strategy_name = strategy.name();
    info!("{} tags on the field, strategy {strategy_name}", field.len());

    let detections = load_detections(&args.detections)?;
    let localizer = CameraLocalizer::new(strategy, field, camera);
    let result = localizer.localize(detections);

    if result.estimated_pose.is_none() {
        warn!("no pose from {} usable detection(s)", result.detections.len());
    }
    if !args.quiet {
        eprintln!("  used {} detections", result.detections.len());
    }

    let output = Output {
        strategy: strategy_name,
        camera_in_world: result.estimated_pose.as_ref().map(Transform::inverse),
        world_in_camera: result.estimated_pose,
        detections_used: result.detections.iter().map(|d| d.tag_id).collect(),
    };
    let json = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{json}");

    Ok(())
}
