//! Acquisition boundary.
//!
//! Hardware drivers live outside this crate; they plug in through
//! [`ImuSource`] and [`GpsSource`]. When nothing is attached the simulated
//! sources below stand in, the same way the mock readers do on a desktop.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::error::{AttitudeError, AttitudeResult};
use crate::restart_manager::{RestartState, DEFAULT_MAX_COOLDOWN};
use crate::types::{GpsFix, ImuReading};

pub const STANDARD_PRESSURE_HPA: f64 = 1013.25;

/// Calibrated IMU read (accel in g, gyro in deg/s, mag in body axes).
pub trait ImuSource: Send {
    fn read(&mut self) -> AttitudeResult<ImuReading>;
}

/// Raw NMEA sentences from a GPS receiver. `Ok(None)` means the UART had
/// nothing buffered this poll.
pub trait GpsSource: Send {
    fn read_sentence(&mut self) -> AttitudeResult<Option<String>>;
}

/// The magnetometer is mounted rotated relative to the IMU:
/// body = (raw_y, raw_z, -raw_x).
pub fn remap_mag_axes(raw: [f64; 3]) -> [f64; 3] {
    [raw[1], raw[2], -raw[0]]
}

// ─── Simulated IMU ───────────────────────────────────────────────────────────

/// Vehicle sitting level and yawing at a constant rate.
pub struct SimulatedImu {
    yaw_rate_dps: f64,
    sample_period: f64,
    with_mag: bool,
    fail_every: Option<u64>,
    reads: u64,
}

impl SimulatedImu {
    pub fn new(yaw_rate_dps: f64, sample_period: f64) -> Self {
        Self {
            yaw_rate_dps,
            sample_period,
            with_mag: true,
            fail_every: None,
            reads: 0,
        }
    }

    pub fn without_mag(mut self) -> Self {
        self.with_mag = false;
        self
    }

    /// Every `n`-th read fails with a sensor error (`n = 0` disables).
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = if n == 0 { None } else { Some(n) };
        self
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl ImuSource for SimulatedImu {
    fn read(&mut self) -> AttitudeResult<ImuReading> {
        self.reads += 1;
        if let Some(n) = self.fail_every {
            if self.reads % n == 0 {
                return Err(AttitudeError::Sensor(format!(
                    "simulated bus error on read {}",
                    self.reads
                )));
            }
        }

        let t = self.reads as f64 * self.sample_period;
        let yaw = (self.yaw_rate_dps * t).to_radians();
        // Small vibration so the deadband has something to suppress
        let jitter = 0.01 * (t * 40.0).sin();

        let mag = if self.with_mag {
            // North seen from the body, expressed in the raw sensor frame
            let body = [yaw.cos(), -yaw.sin(), 0.0];
            Some(remap_mag_axes([-body[2], body[0], body[1]]))
        } else {
            None
        };

        Ok(ImuReading {
            accel: [0.002 * jitter, -0.002 * jitter, 1.0],
            gyro: [jitter, -jitter, self.yaw_rate_dps],
            mag,
            temperature: 21.5 + 0.5 * (t * 0.1).sin(),
            pressure_hpa: STANDARD_PRESSURE_HPA - 0.05 * t,
        })
    }
}

// ─── NMEA ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NmeaSentence {
    /// Fix data; `valid` is false when the receiver reports no fix
    Gga(GpsFix),
    /// Recommended minimum; position only
    Rmc {
        latitude: f64,
        longitude: f64,
        speed_knots: f64,
        valid: bool,
    },
    Other(String),
}

/// "ddmm.mmmm" / "dddmm.mmmm" plus hemisphere to signed decimal degrees.
pub fn nmea_to_degrees(value: &str, hemisphere: &str) -> Option<f64> {
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value.get(..dot - 2)?.parse().ok()?;
    let minutes: f64 = value.get(dot - 2..)?.parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "S" | "W" => Some(-decimal),
        _ => Some(decimal),
    }
}

fn verify_checksum(line: &str) -> AttitudeResult<&str> {
    let body = line
        .strip_prefix('$')
        .ok_or_else(|| AttitudeError::InvalidInput(format!("not an NMEA sentence: {}", line)))?;
    let (payload, checksum) = match body.split_once('*') {
        Some((payload, checksum)) => (payload, Some(checksum)),
        None => (body, None),
    };
    if let Some(expected) = checksum {
        let expected = u8::from_str_radix(expected.trim(), 16)
            .map_err(|_| AttitudeError::InvalidInput(format!("bad checksum field: {}", line)))?;
        let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        if actual != expected {
            return Err(AttitudeError::InvalidInput(format!(
                "checksum mismatch: expected {:02X}, got {:02X}",
                expected, actual
            )));
        }
    }
    Ok(payload)
}

pub fn parse_nmea(line: &str) -> AttitudeResult<NmeaSentence> {
    let payload = verify_checksum(line.trim())?;
    let parts: Vec<&str> = payload.split(',').collect();
    let kind = parts[0];
    let field = |i: usize| parts.get(i).copied().unwrap_or("");

    if kind.ends_with("GGA") {
        if parts.len() < 10 {
            return Err(AttitudeError::InvalidInput(format!(
                "GGA sentence has {} fields",
                parts.len()
            )));
        }
        let quality = field(6);
        let position = nmea_to_degrees(field(2), field(3)).zip(nmea_to_degrees(field(4), field(5)));
        let fix = match position {
            Some((latitude, longitude)) if !quality.is_empty() && quality != "0" => GpsFix {
                latitude,
                longitude,
                altitude: field(9).parse().unwrap_or(0.0),
                satellites: field(7).parse().unwrap_or(0),
                valid: true,
            },
            _ => GpsFix::default(),
        };
        return Ok(NmeaSentence::Gga(fix));
    }

    if kind.ends_with("RMC") {
        let position = nmea_to_degrees(field(3), field(4)).zip(nmea_to_degrees(field(5), field(6)));
        let (latitude, longitude) = position.unwrap_or((0.0, 0.0));
        return Ok(NmeaSentence::Rmc {
            latitude,
            longitude,
            speed_knots: field(7).parse().unwrap_or(0.0),
            valid: field(2) == "A" && position.is_some(),
        });
    }

    Ok(NmeaSentence::Other(kind.to_string()))
}

fn format_nmea(payload: &str) -> String {
    let checksum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${}*{:02X}", payload, checksum)
}

fn degrees_to_nmea(value: f64, degree_digits: usize) -> String {
    let abs = value.abs();
    let degrees = abs.trunc();
    let minutes = (abs - degrees) * 60.0;
    format!("{:0width$}{:07.4}", degrees as u32, minutes, width = degree_digits)
}

// ─── Simulated GPS ───────────────────────────────────────────────────────────

/// Emits checksummed GGA sentences drifting slowly north-east. Every
/// `no_fix_every`-th sentence reports no fix.
pub struct SimulatedGps {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    no_fix_every: Option<u64>,
    sentences: u64,
}

impl SimulatedGps {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            no_fix_every: None,
            sentences: 0,
        }
    }

    pub fn dropping_fix_every(mut self, n: u64) -> Self {
        self.no_fix_every = if n == 0 { None } else { Some(n) };
        self
    }
}

impl GpsSource for SimulatedGps {
    fn read_sentence(&mut self) -> AttitudeResult<Option<String>> {
        self.sentences += 1;
        let seq = self.sentences as f64;
        let lat = self.latitude + seq * 1e-6;
        let lon = self.longitude + seq * 1e-6;
        let alt = self.altitude + 0.1 * seq;

        let no_fix = self.no_fix_every.map(|n| self.sentences % n == 0).unwrap_or(false);
        let payload = if no_fix {
            "GPGGA,120000.00,,,,,0,00,99.9,,M,,M,,".to_string()
        } else {
            format!(
                "GPGGA,120000.00,{},{},{},{},1,08,0.9,{:.1},M,0.0,M,,",
                degrees_to_nmea(lat, 2),
                if lat >= 0.0 { "N" } else { "S" },
                degrees_to_nmea(lon, 3),
                if lon >= 0.0 { "E" } else { "W" },
                alt
            )
        };
        Ok(Some(format_nmea(&payload)))
    }
}

// ─── GPS task ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct GpsTaskReport {
    pub sentences: u64,
    pub valid_fixes: u64,
    pub restart: RestartState,
}

/// Poll `source` every `period`, publish each valid GGA fix through `tx`.
///
/// Invalid fixes and other sentence types never overwrite the published fix.
/// Runs until `shutdown` flips to true or its sender goes away.
pub async fn gps_loop<S: GpsSource>(
    mut source: S,
    period: Duration,
    backoff: Duration,
    tx: watch::Sender<GpsFix>,
    mut shutdown: watch::Receiver<bool>,
) -> GpsTaskReport {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut restart = RestartState::new("gps", backoff, DEFAULT_MAX_COOLDOWN);
    let mut sentences = 0u64;
    let mut valid_fixes = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let result = source.read_sentence().and_then(|line| match line {
            Some(line) => parse_nmea(&line).map(Some),
            None => Ok(None),
        });

        match result {
            Ok(Some(NmeaSentence::Gga(fix))) => {
                sentences += 1;
                if fix.valid {
                    valid_fixes += 1;
                    log::debug!(
                        "[gps] fix {:.6}, {:.6} alt {:.1} m, {} sats",
                        fix.latitude,
                        fix.longitude,
                        fix.altitude,
                        fix.satellites
                    );
                    tx.send_replace(fix);
                }
                restart.record_success();
            }
            Ok(Some(_)) => {
                sentences += 1;
                restart.record_success();
            }
            Ok(None) => restart.record_success(),
            Err(e) => {
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

    log::info!("[gps] stopped after {} sentences, {} valid fixes", sentences, valid_fixes);
    GpsTaskReport {
        sentences,
        valid_fixes,
        restart,
    }
}
