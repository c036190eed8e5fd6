//! Recorded runs, stored as JSON (gzip when the path ends in `.gz`).

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::sensor_fusion::{EngineConfig, EngineState};
use crate::types::SensorSample;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// RFC 3339, UTC
    pub started_at: String,
    pub config: EngineConfig,
    pub samples: Vec<SensorSample>,
    #[serde(default)]
    pub final_state: Option<EngineState>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            started_at: Utc::now().to_rfc3339(),
            config,
            samples: Vec::new(),
            final_state: None,
        }
    }

    /// Seconds between the first and last sample.
    pub fn duration(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

pub fn save_session(session: &Session, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    if is_gzip(path) {
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer_pretty(&mut gz, session)?;
        gz.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, session)?;
        writer.flush()?;
    }
    Ok(())
}

pub fn load_session(path: &Path) -> anyhow::Result<Session> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let session = if is_gzip(path) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor_fusion::FilterKind;

    fn session() -> Session {
        let config = EngineConfig { filter: FilterKind::Kalman, ..EngineConfig::default() };
        let mut s = Session::new(config);
        for i in 0..5 {
            s.samples.push(SensorSample {
                timestamp: i as f64 * 0.05,
                accel: [0.0, 0.0, 1.0],
                gyro: [0.0, 0.0, 12.5],
                mag: if i % 2 == 0 { Some([1.0, 0.0, 0.0]) } else { None },
                dt: 0.05,
            });
        }
        s
    }

    #[test]
    fn test_round_trip_through_gzip() {
        let path = std::env::temp_dir().join(format!("flight_attitude_{}.json.gz", std::process::id()));
        let original = session();
        save_session(&original, &path).unwrap();
        let loaded = load_session(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.samples, original.samples);
        assert_eq!(loaded.config, original.config);
        assert_eq!(loaded.started_at, original.started_at);
    }

    #[test]
    fn test_plain_json_and_duration() {
        let path = std::env::temp_dir().join(format!("flight_attitude_{}.json", std::process::id()));
        save_session(&session(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let loaded = load_session(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert!(text.contains("\"filter\": \"kalman\""));
        assert!((loaded.duration() - 0.2).abs() < 1e-12);
        assert!(loaded.final_state.is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("flight_attitude_does_not_exist.json");
        assert!(load_session(&path).is_err());
    }
}
