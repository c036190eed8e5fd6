//! The periodic fusion task.
//!
//! Each tick: measure dt, read the IMU, run the engine, hand a frame to the
//! telemetry task. A failing tick is logged and backed off; the engine is
//! only touched by ticks that produced a complete sample.

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};

use crate::restart_manager::{RestartState, DEFAULT_MAX_COOLDOWN};
use crate::sensor_fusion::{AttitudeEngine, EngineConfig};
use crate::sensors::ImuSource;
use crate::telemetry::TelemetryFrame;
use crate::types::{AttitudeEstimate, GpsFix, SensorSample};

#[derive(Clone, Debug)]
pub struct SamplingSettings {
    pub period: Duration,
    pub backoff: Duration,
    /// Stop after this many ticks (successful or not)
    pub max_iterations: Option<u64>,
    /// Keep every processed sample for the session file
    pub record: bool,
}

impl SamplingSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            period: Duration::from_millis(config.sample_period_ms),
            backoff: Duration::from_millis(config.error_backoff_ms),
            max_iterations: None,
            record: true,
        }
    }
}

pub struct SamplingReport {
    pub engine: AttitudeEngine,
    pub iterations: u64,
    pub processed: u64,
    pub failures: u64,
    pub frames_dropped: u64,
    pub samples: Vec<SensorSample>,
    pub last_estimate: Option<AttitudeEstimate>,
    pub restart: RestartState,
}

pub async fn run_sampling_loop<S: ImuSource>(
    mut engine: AttitudeEngine,
    mut source: S,
    settings: SamplingSettings,
    gps: watch::Receiver<GpsFix>,
    frames: mpsc::Sender<TelemetryFrame>,
    mut shutdown: watch::Receiver<bool>,
) -> SamplingReport {
    let mut ticker = interval(settings.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut restart = RestartState::new("imu", settings.backoff, DEFAULT_MAX_COOLDOWN);

    let start = Instant::now();
    // dt spans back to the last sample that reached the filter
    let mut last_processed: Option<Instant> = None;

    let mut iterations = 0u64;
    let mut processed = 0u64;
    let mut failures = 0u64;
    let mut frames_dropped = 0u64;
    let mut samples = Vec::new();
    let mut last_estimate = None;

    log::info!(
        "[imu] sampling every {} ms with {} filter",
        settings.period.as_millis(),
        engine.get_state().filter
    );

    loop {
        if let Some(max) = settings.max_iterations {
            if iterations >= max {
                break;
            }
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        iterations += 1;

        let now = Instant::now();
        let dt = match last_processed {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => settings.period.as_secs_f64(),
        };
        let elapsed = now.duration_since(start).as_secs_f64();

        let outcome = source.read().and_then(|reading| {
            let sample = SensorSample::from_reading(&reading, elapsed, dt);
            engine
                .process(&sample)
                .map(|estimate| (reading, sample, estimate))
        });

        match outcome {
            Ok((reading, sample, estimate)) => {
                restart.record_success();
                processed += 1;
                last_processed = Some(now);

                let frame = TelemetryFrame {
                    elapsed,
                    reading,
                    estimate: estimate.clone(),
                    gps: gps.borrow().clone(),
                };
                match frames.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => frames_dropped += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        frames_dropped += 1;
                        log::trace!("[imu] telemetry channel closed");
                    }
                }

                if settings.record {
                    samples.push(sample);
                }
                if processed % 100 == 0 {
                    let q = estimate.orientation;
                    log::debug!(
                        "[imu] {} samples, q = ({:.4}, {:.4}, {:.4}, {:.4})",
                        processed,
                        q.w,
                        q.x,
                        q.y,
                        q.z
                    );
                }
                last_estimate = Some(estimate);
            }
            Err(e) => {
                failures += 1;
                let wait = restart.record_failure(&e.to_string());
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!(
        "[imu] stopped after {} ticks: {} processed, {} failed, {} frames dropped",
        iterations,
        processed,
        failures,
        frames_dropped
    );
    SamplingReport {
        engine,
        iterations,
        processed,
        failures,
        frames_dropped,
        samples,
        last_estimate,
        restart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::AttitudeFilter;
    use crate::sensors::SimulatedImu;

    fn settings(max: u64) -> SamplingSettings {
        SamplingSettings {
            period: Duration::from_millis(1),
            backoff: Duration::from_millis(1),
            max_iterations: Some(max),
            record: true,
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let imu = SimulatedImu::new(30.0, 0.001).failing_every(3);
        let (_gps_tx, gps_rx) = watch::channel(GpsFix::default());
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = run_sampling_loop(engine, imu, settings(9), gps_rx, frame_tx, stop_rx).await;

        assert_eq!(report.iterations, 9);
        assert_eq!(report.failures, 3);
        assert_eq!(report.processed, 6);
        assert_eq!(report.samples.len(), 6);
        assert_eq!(report.engine.get_state().samples_processed, 6);
        assert_eq!(report.restart.total_failures, 3);
        assert!(report.engine.filter().orientation().is_unit(1e-6));
        assert!(report.samples.iter().all(|s| s.dt > 0.0));

        let mut received = 0;
        while frame_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn test_frames_carry_latest_gps_fix() {
        let engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let imu = SimulatedImu::new(0.0, 0.001);
        let fix = GpsFix {
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
            satellites: 7,
            valid: true,
        };
        let (_gps_tx, gps_rx) = watch::channel(fix.clone());
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = run_sampling_loop(engine, imu, settings(2), gps_rx, frame_tx, stop_rx).await;
        assert_eq!(report.processed, 2);

        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(frame.gps, fix);
        assert_eq!(frame.estimate.filter, "madgwick");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let engine = AttitudeEngine::new(EngineConfig::default()).unwrap();
        let imu = SimulatedImu::new(10.0, 0.001);
        let (_gps_tx, gps_rx) = watch::channel(GpsFix::default());
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let settings = SamplingSettings { max_iterations: None, ..settings(0) };
        let task = tokio::spawn(run_sampling_loop(engine, imu, settings, gps_rx, frame_tx, stop_rx));
        sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let report = task.await.unwrap();
        assert!(report.iterations > 0);
        // channel of one: everything past the first frame is dropped
        assert_eq!(report.frames_dropped, report.processed.saturating_sub(1));
    }
}
