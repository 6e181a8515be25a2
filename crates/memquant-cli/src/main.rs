//! memquant: quantify membrane and cytoplasm intensity along cell
//! boundaries from the command line.
//!
//! Loads one or more frames and a rough boundary, runs the
//! quantification pipeline, and writes the results as JSON.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin memquant -- --roi cell.txt [OPTIONS] <FRAMES>...
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod roi_file;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, info};
use memquant_pipeline::{Frame, QuantConfig, QuantResult, Quantifier, Roi};

/// Membrane and cytoplasm quantification along cell boundaries.
///
/// Straightens each frame along its ROI, fits a membrane peak plus a
/// cytoplasm step to every cross-section while refining the boundary,
/// and prints the fitted quantities as JSON.
#[derive(Parser)]
#[command(name = "memquant", version)]
struct Cli {
    /// Input frames (PNG, JPEG, BMP, TIFF), one image per frame.
    #[arg(required = true)]
    frames: Vec<PathBuf>,

    /// ROI file: `x y` lines, or JSON `[[x, y], ...]` (one ROI for all
    /// frames) or `[[[x, y], ...], ...]` (one ROI per frame).
    #[arg(long)]
    roi: PathBuf,

    /// Membrane/cytoplasm kernel width, in cross-section samples.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_SIGMA)]
    sigma: f64,

    /// Cross-section length in pixels.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_THICKNESS)]
    thickness: usize,

    /// Rolling-average window along the boundary, in ROI points.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_SMOOTHING_WINDOW)]
    smoothing_window: usize,

    /// Maximum boundary offset in pixels (0 freezes the boundary).
    #[arg(long, default_value_t = QuantConfig::DEFAULT_FREEDOM)]
    freedom: f64,

    /// Number of spline knots describing the boundary offset.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_ROI_KNOTS)]
    roi_knots: usize,

    /// Resample every profile to this many positions [default: 100].
    #[arg(long, conflicts_with = "no_nfits")]
    nfits: Option<usize>,

    /// Fit every ROI point instead of resampling.
    #[arg(long)]
    no_nfits: bool,

    /// Sample/fit/refine rounds.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Optimizer learning rate.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_LEARNING_RATE)]
    learning_rate: f64,

    /// Optimizer steps per round.
    #[arg(long, default_value_t = QuantConfig::DEFAULT_DESCENT_STEPS)]
    descent_steps: usize,

    /// Treat the ROI as an open curve.
    #[arg(long)]
    no_periodic: bool,

    /// Restart closed ROIs at the end of their long axis after refining.
    #[arg(long)]
    rotate: bool,

    /// Learn sigma jointly with the other parameters.
    #[arg(long)]
    adaptive_sigma: bool,

    /// Normalize all frames by one shared intensity scale.
    #[arg(long)]
    batch_norm: bool,

    /// Fit a free baseline outside the cell.
    #[arg(long)]
    fit_outer: bool,

    /// Record parameters at every step of the final round.
    #[arg(long)]
    save_training: bool,

    /// Record simulated profiles at every step of the final round.
    #[arg(long)]
    save_sims: bool,

    /// Full quantification config as a JSON string.
    ///
    /// When provided, all other quantification flags are ignored.
    /// The JSON must be a valid `QuantConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Write results JSON to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the refined ROIs as JSON to this file.
    #[arg(long)]
    roi_output: Option<PathBuf>,

    /// Print a timing and convergence report to stderr.
    #[arg(long)]
    report: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Build a [`QuantConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<QuantConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(QuantConfig {
        sigma: cli.sigma,
        periodic: !cli.no_periodic,
        thickness: cli.thickness,
        smoothing_window: cli.smoothing_window,
        freedom: cli.freedom,
        roi_knots: cli.roi_knots,
        nfits: if cli.no_nfits {
            None
        } else {
            cli.nfits.or(QuantConfig::DEFAULT_NFITS)
        },
        iterations: cli.iterations,
        rotate: cli.rotate,
        learning_rate: cli.learning_rate,
        descent_steps: cli.descent_steps,
        adaptive_sigma: cli.adaptive_sigma,
        batch_norm: cli.batch_norm,
        fit_outer: cli.fit_outer,
        save_training: cli.save_training,
        save_sims: cli.save_sims,
    })
}

const fn level_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_frame(path: &Path) -> Result<Frame, String> {
    let image = image::open(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    info!(
        "loaded {} ({}x{})",
        path.display(),
        image.width(),
        image.height()
    );
    Ok(Frame::from_dynamic(&image))
}

fn load_rois(path: &Path) -> Result<Vec<Roi>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    roi_file::parse(&text).map_err(|e| format!("Error parsing {}: {e}", path.display()))
}

fn write_output(path: Option<&Path>, contents: &str) -> Result<(), String> {
    match path {
        Some(path) => std::fs::write(path, contents)
            .map_err(|e| format!("Error writing {}: {e}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}

fn run(cli: &Cli) -> Result<QuantResult, String> {
    let config = config_from_cli(cli)?;
    let frames = cli
        .frames
        .iter()
        .map(PathBuf::as_path)
        .map(load_frame)
        .collect::<Result<Vec<_>, _>>()?;
    let rois = load_rois(&cli.roi)?;
    info!(
        "{} frame(s), {} ROI(s), {} iteration(s) of {} steps",
        frames.len(),
        rois.len(),
        config.iterations,
        config.descent_steps
    );

    let quantifier =
        Quantifier::new(frames, rois, config).map_err(|e| format!("Invalid input: {e}"))?;
    quantifier
        .run()
        .map_err(|e| format!("Quantification failed: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(level_filter(cli.verbose))
        .init()
    {
        eprintln!("Warning: logger not initialized: {e}");
    }

    let result = match run(&cli) {
        Ok(result) => result,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    if cli.report {
        eprintln!("{}", result.diagnostics.report());
    }

    if let Some(ref roi_path) = cli.roi_output {
        let written = roi_file::to_json(&result.refined_rois)
            .map_err(|e| format!("Error serializing refined ROIs: {e}"))
            .and_then(|json| write_output(Some(roi_path), &json));
        if let Err(msg) = written {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    }

    let written = serde_json::to_string_pretty(&result)
        .map_err(|e| format!("Error serializing results: {e}"))
        .and_then(|json| write_output(cli.output.as_deref(), &json));
    if let Err(msg) = written {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("memquant").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_pipeline_config() {
        let cli = parse(&["--roi", "cell.txt", "frame.png"]);
        assert_eq!(config_from_cli(&cli).unwrap(), QuantConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--roi",
            "cell.txt",
            "--no-periodic",
            "--no-nfits",
            "--freedom",
            "0",
            "--adaptive-sigma",
            "a.png",
            "b.png",
        ]);
        assert_eq!(cli.frames.len(), 2);
        let config = config_from_cli(&cli).unwrap();
        assert!(!config.periodic);
        assert_eq!(config.nfits, None);
        assert!(config.freedom.abs() < f64::EPSILON);
        assert!(config.adaptive_sigma);
    }

    #[test]
    fn nfits_and_no_nfits_conflict() {
        let args = ["memquant", "--roi", "r", "--nfits", "50", "--no-nfits", "f.png"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn config_json_replaces_flags() {
        let cli = parse(&[
            "--roi",
            "cell.txt",
            "--thickness",
            "10",
            "--config-json",
            r#"{"thickness": 30, "iterations": 4}"#,
            "frame.png",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.thickness, 30);
        assert_eq!(config.iterations, 4);
        assert!((config.sigma - QuantConfig::DEFAULT_SIGMA).abs() < f64::EPSILON);

        let bad = parse(&["--roi", "r", "--config-json", "{", "f.png"]);
        assert!(config_from_cli(&bad).unwrap_err().contains("--config-json"));
    }

    #[test]
    fn frames_and_roi_are_required() {
        assert!(Cli::try_parse_from(["memquant", "--roi", "r"]).is_err());
        assert!(Cli::try_parse_from(["memquant", "f.png"]).is_err());
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_filter(0), LevelFilter::Warn);
        assert_eq!(level_filter(2), LevelFilter::Debug);
        assert_eq!(level_filter(9), LevelFilter::Trace);
    }
}
