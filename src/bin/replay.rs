use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::json;

use flight_attitude::filters::AttitudeFilter;
use flight_attitude::session::load_session;
use flight_attitude::types::Vec3;
use flight_attitude::{AttitudeEngine, FilterKind};

#[derive(Parser, Debug)]
struct Args {
    /// Path to session_*.json[.gz]
    #[arg(long, conflicts_with = "session_dir")]
    session: Option<PathBuf>,

    /// Directory of sessions to batch replay (processes session_*.json[.gz])
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Override the recorded filter variant
    #[arg(long, value_enum)]
    filter: Option<FilterKind>,

    /// Override the gradient-descent gain
    #[arg(long)]
    beta: Option<f64>,

    /// Override the bias filter gain
    #[arg(long)]
    bias_gain: Option<f64>,

    /// Override the smoothing window
    #[arg(long)]
    smoothing_window: Option<usize>,

    /// Treat the first N samples as stationary and estimate the gyro offset
    #[arg(long, default_value = "0")]
    calibrate: usize,
}

fn run_once(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let session = load_session(path)?;

    let mut config = session.config.clone();
    if let Some(filter) = args.filter {
        config.filter = filter;
    }
    if let Some(beta) = args.beta {
        config.beta = beta;
    }
    if let Some(gain) = args.bias_gain {
        config.bias_gain = gain;
    }
    if let Some(window) = args.smoothing_window {
        config.smoothing_window = window;
    }

    let mut engine = AttitudeEngine::new(config)?;
    let calibration_len = args.calibrate.min(session.samples.len());
    let offset = if calibration_len > 0 {
        engine.calibrate_gyro(&session.samples[..calibration_len])
    } else {
        Vec3::from(engine.config().gyro_offset)
    };

    let mut rejected = 0usize;
    let mut lag_sum = 0.0;
    let mut lag_max: f64 = 0.0;
    let mut processed = 0usize;

    for sample in &session.samples[calibration_len..] {
        match engine.process(sample) {
            Ok(estimate) => {
                let lag = estimate.orientation.angle_to(&estimate.smoothed.normalize());
                lag_sum += lag;
                lag_max = lag_max.max(lag);
                processed += 1;
            }
            Err(e) => {
                rejected += 1;
                log::warn!("sample at {:.3}s rejected: {}", sample.timestamp, e);
            }
        }
    }

    let q = engine.filter().orientation();
    let (roll, pitch, yaw) = q.to_euler();
    let bias = engine.filter().gyro_bias().map(|b| [b.x, b.y, b.z]);
    let mean_lag = if processed > 0 { lag_sum / processed as f64 } else { 0.0 };

    Ok(json!({
        "session": path.display().to_string(),
        "started_at": session.started_at,
        "filter": engine.filter().name(),
        "duration_s": session.duration(),
        "samples": session.samples.len(),
        "calibration_samples": calibration_len,
        "gyro_offset": [offset.x, offset.y, offset.z],
        "processed": processed,
        "rejected": rejected,
        "final_quaternion": q.to_array(),
        "final_euler_deg": [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()],
        "gyro_bias": bias,
        "mean_smoothing_lag_rad": mean_lag,
        "max_smoothing_lag_rad": lag_max
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut results = Vec::new();

    if let Some(dir) = args.session_dir.as_ref() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !(name.starts_with("session_") && (name.ends_with(".json") || name.ends_with(".json.gz"))) {
                continue;
            }
            match run_once(&path, &args) {
                Ok(res) => results.push(res),
                Err(e) => log::error!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(session) = args.session.as_ref() {
        results.push(run_once(session, &args)?);
    } else {
        anyhow::bail!("Provide --session or --session-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
