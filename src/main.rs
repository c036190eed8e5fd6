use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

use flight_attitude::filters::AttitudeFilter;
use flight_attitude::sampling::{run_sampling_loop, SamplingSettings};
use flight_attitude::sensors::{gps_loop, SimulatedGps, SimulatedImu};
use flight_attitude::session::{save_session, Session};
use flight_attitude::telemetry::{telemetry_loop, CsvLogger, LoopbackRadio, TelemetryFrame};
use flight_attitude::{AttitudeEngine, EngineConfig, FilterKind, GpsFix};

#[derive(Parser, Debug)]
#[command(name = "flight_attitude")]
#[command(about = "Onboard attitude estimation: IMU fusion, CSV logging, radio telemetry", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON engine config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attitude filter variant
    #[arg(long, value_enum)]
    filter: Option<FilterKind>,

    /// Gradient-descent gain
    #[arg(long)]
    beta: Option<f64>,

    /// Fixed correction gain of the bias filter
    #[arg(long)]
    bias_gain: Option<f64>,

    /// Moving-average window over filter outputs
    #[arg(long)]
    smoothing_window: Option<usize>,

    /// Transmit raw filter output instead of the moving average
    #[arg(long)]
    no_smoothing: bool,

    /// Sampling period in milliseconds
    #[arg(long)]
    sample_period_ms: Option<u64>,

    /// Output directory
    #[arg(long, default_value = "flight_sessions")]
    output_dir: String,

    /// Gzip the session file
    #[arg(long)]
    gzip: bool,

    /// Simulated yaw rate (deg/s)
    #[arg(long, default_value = "20.0")]
    yaw_rate: f64,

    /// Make every N-th simulated IMU read fail (0 = never)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Simulate an IMU without magnetometer
    #[arg(long)]
    no_mag: bool,
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
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
    if args.no_smoothing {
        config.smoothing_enabled = false;
    }
    if let Some(period) = args.sample_period_ms {
        config.sample_period_ms = period;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    println!("[{}] Flight attitude engine starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Filter: {:?}", config.filter);
    println!("  Sample period: {} ms", config.sample_period_ms);
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;
    let stamp = ts_now_clean();
    let csv_path = PathBuf::from(&args.output_dir).join(format!("sensor_log_{}.csv", stamp));
    let logger = CsvLogger::create(&csv_path)?;

    let engine = AttitudeEngine::new(config.clone())?;
    let period_secs = config.sample_period_ms as f64 / 1000.0;
    let mut imu = SimulatedImu::new(args.yaw_rate, period_secs).failing_every(args.fail_every);
    if args.no_mag {
        imu = imu.without_mag();
    }
    let gps = SimulatedGps::new(37.7749, -122.4194, 15.0).dropping_fix_every(10);

    let (fix_tx, fix_rx) = watch::channel(GpsFix::default());
    let (frame_tx, frame_rx) = mpsc::channel::<TelemetryFrame>(500);
    let (stop_tx, stop_rx) = watch::channel(false);

    let gps_handle = tokio::spawn(gps_loop(
        gps,
        Duration::from_millis(config.gps_period_ms),
        Duration::from_millis(config.error_backoff_ms),
        fix_tx,
        stop_rx.clone(),
    ));
    let telemetry_handle = tokio::spawn(telemetry_loop::<BufWriter<File>, _>(
        frame_rx,
        Some(logger),
        LoopbackRadio::new(-60.0),
    ));
    let sampling_handle = tokio::spawn(run_sampling_loop(
        engine,
        imu,
        SamplingSettings::from_config(&config),
        fix_rx,
        frame_tx,
        stop_rx,
    ));

    println!("[{}] Sampling...", ts_now());
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                println!("[{}] Duration reached, stopping...", ts_now());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        println!("[{}] Interrupted, stopping...", ts_now());
    }
    let _ = stop_tx.send(true);

    let sampling = sampling_handle.await?;
    let gps_report = gps_handle.await?;
    let telemetry = telemetry_handle.await?;

    let mut session = Session::new(config);
    session.samples = sampling.samples;
    session.final_state = Some(sampling.engine.get_state());
    let extension = if args.gzip { "json.gz" } else { "json" };
    let session_path = PathBuf::from(&args.output_dir).join(format!("session_{}.{}", stamp, extension));
    save_session(&session, &session_path)?;
    println!(
        "[{}] Saved {} samples to {}",
        ts_now(),
        session.samples.len(),
        session_path.display()
    );

    let q = sampling.engine.filter().orientation();
    let (roll, pitch, yaw) = q.to_euler();
    println!("\n=== Final Stats ===");
    println!("Ticks: {} ({} processed, {} failed)", sampling.iterations, sampling.processed, sampling.failures);
    println!("{}", sampling.restart.status());
    println!("GPS: {} sentences, {} valid fixes", gps_report.sentences, gps_report.valid_fixes);
    println!(
        "Telemetry: {} rows, {} packets, {} failures",
        telemetry.rows_written, telemetry.packets_sent, telemetry.failures
    );
    if let Some(rx) = telemetry.sink.last_received() {
        println!("Last ground line: {}", rx.to_serial_line());
    }
    println!(
        "Attitude: roll {:.2}°, pitch {:.2}°, yaw {:.2}°",
        roll.to_degrees(),
        pitch.to_degrees(),
        yaw.to_degrees()
    );
    if let Some(bias) = sampling.engine.filter().gyro_bias() {
        println!("Gyro bias: ({:.5}, {:.5}, {:.5}) rad/s", bias.x, bias.y, bias.z);
    }
    println!("CSV log: {}", csv_path.display());

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
