//! Consumers of attitude estimates: CSV log rows and the radio packet.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{AttitudeError, AttitudeResult};
use crate::quaternion::Quaternion;
use crate::types::{AttitudeEstimate, GpsFix, ImuReading};

pub const CSV_HEADER: &str = "elapsed_time,temperature,pressure,\
accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,mag_x,mag_y,mag_z,\
gps_latitude,gps_longitude,gps_altitude,gps_satellites,gps_status,\
q_w,q_x,q_y,q_z";

/// `<4f3fif`: quaternion, lat, lon, alt, satellites, pressure
pub const PACKET_LEN: usize = 36;

/// Everything one sampling iteration hands to the telemetry task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Seconds since the run started
    pub elapsed: f64,
    pub reading: ImuReading,
    pub estimate: AttitudeEstimate,
    pub gps: GpsFix,
}

// ─── CSV ─────────────────────────────────────────────────────────────────────

pub struct CsvLogger<W: Write> {
    writer: W,
    rows: u64,
}

impl CsvLogger<BufWriter<File>> {
    pub fn create(path: &Path) -> AttitudeResult<Self> {
        let file = File::create(path).map_err(|e| {
            AttitudeError::Transport(format!("cannot create {}: {}", path.display(), e))
        })?;
        CsvLogger::new(BufWriter::new(file))
    }
}

impl<W: Write> CsvLogger<W> {
    /// Writes the header immediately.
    pub fn new(mut writer: W) -> AttitudeResult<Self> {
        writeln!(writer, "{}", CSV_HEADER).map_err(transport)?;
        Ok(Self { writer, rows: 0 })
    }

    /// The logged quaternion is the raw filter output; the radio carries
    /// the smoothed one.
    pub fn write_frame(&mut self, frame: &TelemetryFrame) -> AttitudeResult<()> {
        let r = &frame.reading;
        let mag = r.mag.unwrap_or([0.0; 3]);
        let gps = &frame.gps;
        let q = frame.estimate.orientation;
        writeln!(
            self.writer,
            "{:.3},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            frame.elapsed,
            r.temperature,
            r.pressure_hpa,
            r.accel[0],
            r.accel[1],
            r.accel[2],
            r.gyro[0],
            r.gyro[1],
            r.gyro[2],
            mag[0],
            mag[1],
            mag[2],
            gps.latitude,
            gps.longitude,
            gps.altitude,
            gps.satellites,
            gps.status(),
            q.w,
            q.x,
            q.y,
            q.z
        )
        .map_err(transport)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> AttitudeResult<()> {
        self.writer.flush().map_err(transport)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn transport(e: std::io::Error) -> AttitudeError {
    AttitudeError::Transport(e.to_string())
}

// ─── Radio packet ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub quaternion: [f32; 4],
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
    pub satellites: i32,
    pub pressure: f32,
}

pub fn encode_packet(q: &Quaternion, gps: &GpsFix, pressure_hpa: f64) -> [u8; PACKET_LEN] {
    let mut buf = [0u8; PACKET_LEN];
    let floats = q.to_f32_array();
    let fields: [[u8; 4]; 9] = [
        floats[0].to_le_bytes(),
        floats[1].to_le_bytes(),
        floats[2].to_le_bytes(),
        floats[3].to_le_bytes(),
        (gps.latitude as f32).to_le_bytes(),
        (gps.longitude as f32).to_le_bytes(),
        (gps.altitude as f32).to_le_bytes(),
        gps.satellites.to_le_bytes(),
        (pressure_hpa as f32).to_le_bytes(),
    ];
    for (chunk, field) in buf.chunks_exact_mut(4).zip(fields.iter()) {
        chunk.copy_from_slice(field);
    }
    buf
}

pub fn decode_packet(data: &[u8]) -> AttitudeResult<TelemetryPacket> {
    if data.len() != PACKET_LEN {
        return Err(AttitudeError::InvalidInput(format!(
            "packet must be {} bytes, got {}",
            PACKET_LEN,
            data.len()
        )));
    }
    let word = |i: usize| -> [u8; 4] {
        let mut w = [0u8; 4];
        w.copy_from_slice(&data[i * 4..i * 4 + 4]);
        w
    };
    let f = |i: usize| f32::from_le_bytes(word(i));

    Ok(TelemetryPacket {
        quaternion: [f(0), f(1), f(2), f(3)],
        latitude: f(4),
        longitude: f(5),
        altitude: f(6),
        satellites: i32::from_le_bytes(word(7)),
        pressure: f(8),
    })
}

// ─── Ground side ─────────────────────────────────────────────────────────────

/// One decoded packet as the ground station reports it, with GPS fields
/// replaced by the last plausible ones when the packet carried none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceivedTelemetry {
    pub quaternion: [f32; 4],
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
    pub satellites: i32,
    pub pressure: f32,
    pub rssi: f64,
    /// False when the GPS fields are remembered rather than fresh
    pub gps_fresh: bool,
}

impl ReceivedTelemetry {
    /// Serial console line: q, lon, lat, alt, satellites, pressure, rssi
    pub fn to_serial_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.quaternion[0],
            self.quaternion[1],
            self.quaternion[2],
            self.quaternion[3],
            self.longitude,
            self.latitude,
            self.altitude,
            self.satellites,
            self.pressure,
            self.rssi
        )
    }
}

#[derive(Clone, Debug, Default)]
struct LastValid {
    latitude: f32,
    longitude: f32,
    altitude: f32,
    satellites: i32,
}

/// Remembers the last plausible GPS block (1..100 satellites) and the last
/// non-zero pressure across received packets.
#[derive(Clone, Debug, Default)]
pub struct GroundTracker {
    last_gps: Option<LastValid>,
    last_pressure: Option<f32>,
    received: u64,
}

pub const MAX_PLAUSIBLE_SATELLITES: i32 = 100;

impl GroundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, data: &[u8], rssi: f64) -> AttitudeResult<ReceivedTelemetry> {
        let packet = decode_packet(data)?;
        self.received += 1;

        let fresh = packet.satellites > 0 && packet.satellites < MAX_PLAUSIBLE_SATELLITES;
        if fresh {
            self.last_gps = Some(LastValid {
                latitude: packet.latitude,
                longitude: packet.longitude,
                altitude: packet.altitude,
                satellites: packet.satellites,
            });
        }
        if packet.pressure != 0.0 {
            self.last_pressure = Some(packet.pressure);
        }

        let gps = self.last_gps.clone().unwrap_or_default();
        Ok(ReceivedTelemetry {
            quaternion: packet.quaternion,
            latitude: gps.latitude,
            longitude: gps.longitude,
            altitude: gps.altitude,
            satellites: gps.satellites,
            pressure: self.last_pressure.unwrap_or(0.0),
            rssi,
            gps_fresh: fresh,
        })
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

// ─── Packet sinks ────────────────────────────────────────────────────────────

pub trait PacketSink: Send {
    fn send(&mut self, packet: &[u8]) -> AttitudeResult<()>;
}

/// Radio stand-in: every packet is "received" straight away by a local
/// [`GroundTracker`] at a fixed RSSI.
pub struct LoopbackRadio {
    tracker: GroundTracker,
    rssi: f64,
    sent: u64,
    last: Option<ReceivedTelemetry>,
}

impl LoopbackRadio {
    pub fn new(rssi: f64) -> Self {
        Self {
            tracker: GroundTracker::new(),
            rssi,
            sent: 0,
            last: None,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn last_received(&self) -> Option<&ReceivedTelemetry> {
        self.last.as_ref()
    }
}

impl PacketSink for LoopbackRadio {
    fn send(&mut self, packet: &[u8]) -> AttitudeResult<()> {
        let received = self.tracker.receive(packet, self.rssi)?;
        log::trace!("[radio] {}", received.to_serial_line());
        self.last = Some(received);
        self.sent += 1;
        Ok(())
    }
}

// ─── Telemetry task ──────────────────────────────────────────────────────────

pub struct TelemetryReport<P> {
    pub frames: u64,
    pub rows_written: u64,
    pub packets_sent: u64,
    pub failures: u64,
    pub sink: P,
}

/// Drain frames until every sender is dropped. Per-frame failures are
/// logged and counted; the task keeps going.
pub async fn telemetry_loop<W, P>(
    mut rx: mpsc::Receiver<TelemetryFrame>,
    mut logger: Option<CsvLogger<W>>,
    mut sink: P,
) -> TelemetryReport<P>
where
    W: Write + Send,
    P: PacketSink,
{
    let mut frames = 0u64;
    let mut packets_sent = 0u64;
    let mut failures = 0u64;

    while let Some(frame) = rx.recv().await {
        frames += 1;

        if let Some(logger) = logger.as_mut() {
            if let Err(e) = logger.write_frame(&frame) {
                failures += 1;
                log::warn!("[telemetry] log write failed: {}", e);
            }
        }

        let packet = encode_packet(&frame.estimate.smoothed, &frame.gps, frame.reading.pressure_hpa);
        match sink.send(&packet) {
            Ok(()) => packets_sent += 1,
            Err(e) => {
                failures += 1;
                log::warn!("[telemetry] packet send failed: {}", e);
            }
        }
    }

    let rows_written = match logger.as_mut() {
        Some(logger) => {
            if let Err(e) = logger.flush() {
                failures += 1;
                log::warn!("[telemetry] final flush failed: {}", e);
            }
            logger.rows()
        }
        None => 0,
    };

    log::info!(
        "[telemetry] {} frames, {} rows, {} packets, {} failures",
        frames,
        rows_written,
        packets_sent,
        failures
    );
    TelemetryReport {
        frames,
        rows_written,
        packets_sent,
        failures,
        sink,
    }
}
