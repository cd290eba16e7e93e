use std::{fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, LoadError};

/// Engine-wide configuration.
///
/// All fields have serde defaults so a partial (or absent) config file is
/// always usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default = "default_collaborator_timeout", with = "duration_ms")]
    pub collaborator_timeout: Duration,

    #[serde(default = "default_true")]
    pub strict_templates: bool,

    #[serde(default = "default_max_flow_depth")]
    pub max_flow_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            collaborator_timeout: default_collaborator_timeout(),
            strict_templates: default_true(),
            max_flow_depth: default_max_flow_depth(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let file = File::open(&path).map_err(|e| LoadError::Schema {
            message: format!("failed to open config file: {}", e),
        })?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader).map_err(|e| LoadError::Schema {
            message: format!("failed to parse config file: {}", e),
        })?;
        Ok(config)
    }
}

fn default_event_buffer_size() -> usize {
    256
}

fn default_collaborator_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_max_flow_depth() -> usize {
    16
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
