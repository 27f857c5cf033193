//! Server configuration.
//!
//! Flat `key = value` files: `#` starts a comment, blank lines are skipped.
//! Operator credentials live in a second file of the same format, named by
//! the `opers-config` key and loaded through the same parser.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys every configuration must supply, with non-blank values.
const REQUIRED_KEYS: &[&str] = &[
    "listen-host",
    "listen-port",
    "server-name",
    "server-info",
    "version",
    "created-date",
    "motd",
    "wakeup-time",
    "ping-time",
    "dead-time",
    "opers-config",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: expected `key = value`", path.display())]
    Malformed { path: PathBuf, line: usize },
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("configuration value is blank: {0}")]
    BlankValue(&'static str),
    #[error("{key} is not a valid duration: {source}")]
    BadDuration {
        key: &'static str,
        #[source]
        source: humantime::DurationError,
    },
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    values: HashMap<String, String>,
    /// How often the liveness sweep wakes up.
    pub wakeup_time: Duration,
    /// Idle time before a registered client is sent a PING.
    pub ping_time: Duration,
    /// Idle time before a client is considered dead.
    pub dead_time: Duration,
    /// Operator name to password.
    pub opers: HashMap<String, String>,
}

impl Config {
    /// Load the configuration from `path` and the operator credentials from
    /// the file its `opers-config` key names.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let values = read_key_values(path)?;
        check_required(&values)?;
        let opers = read_key_values(Path::new(&values["opers-config"]))?;
        Self::from_values(values, opers)
    }

    /// Build a configuration from already-loaded maps, applying the same
    /// validation as [`Config::load`].
    pub fn from_values(
        values: HashMap<String, String>,
        opers: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        check_required(&values)?;
        let wakeup_time = parse_duration_key(&values, "wakeup-time")?;
        let ping_time = parse_duration_key(&values, "ping-time")?;
        let dead_time = parse_duration_key(&values, "dead-time")?;
        Ok(Config {
            values,
            wakeup_time,
            ping_time,
            dead_time,
            opers,
        })
    }

    /// Look up a raw value. Required keys are validated at construction;
    /// unknown keys read as empty.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    /// The `host:port` pair to listen on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.get("listen-host"), self.get("listen-port"))
    }
}

fn check_required(values: &HashMap<String, String>) -> Result<(), ConfigError> {
    for &key in REQUIRED_KEYS {
        match values.get(key) {
            None => return Err(ConfigError::MissingKey(key)),
            Some(value) if value.is_empty() => return Err(ConfigError::BlankValue(key)),
            Some(_) => {}
        }
    }
    Ok(())
}

fn parse_duration_key(
    values: &HashMap<String, String>,
    key: &'static str,
) -> Result<Duration, ConfigError> {
    humantime::parse_duration(&values[key]).map_err(|source| ConfigError::BadDuration { key, source })
}

/// Read a `key = value` file into a map.
fn read_key_values(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    let mut values = HashMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed {
                path: path.to_owned(),
                line: idx + 1,
            });
        };
        values.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn write_temp(contents: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "tarn-config-test-{}-{n}.conf",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn base_values() -> HashMap<String, String> {
        [
            ("listen-host", "127.0.0.1"),
            ("listen-port", "6667"),
            ("server-name", "irc.example.com"),
            ("server-info", "An example server"),
            ("version", "tarn-0.1.0"),
            ("created-date", "2024-06-01"),
            ("motd", "hello"),
            ("wakeup-time", "10s"),
            ("ping-time", "30s"),
            ("dead-time", "4m"),
            ("opers-config", "opers.conf"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn from_values_parses_durations() {
        let config = Config::from_values(base_values(), HashMap::new()).unwrap();
        assert_eq!(config.wakeup_time, Duration::from_secs(10));
        assert_eq!(config.ping_time, Duration::from_secs(30));
        assert_eq!(config.dead_time, Duration::from_secs(240));
        assert_eq!(config.listen_addr(), "127.0.0.1:6667");
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut values = base_values();
        values.remove("motd");
        let err = Config::from_values(values, HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("motd")));
    }

    #[test]
    fn blank_value_is_rejected() {
        let mut values = base_values();
        values.insert("server-name".into(), String::new());
        let err = Config::from_values(values, HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::BlankValue("server-name")));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let mut values = base_values();
        values.insert("ping-time".into(), "soon".into());
        let err = Config::from_values(values, HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::BadDuration { key: "ping-time", .. }));
    }

    #[test]
    fn load_reads_both_files() {
        let opers_path = write_temp("admin = hunter2\nsecond = pw\n");
        let mut contents = String::new();
        for (key, value) in base_values() {
            if key == "opers-config" {
                continue;
            }
            contents.push_str(&format!("{key} = {value}\n"));
        }
        contents.push_str(&format!("opers-config = {}\n", opers_path.display()));
        let path = write_temp(&contents);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.get("server-name"), "irc.example.com");
        assert_eq!(config.opers.get("admin").map(String::as_str), Some("hunter2"));
        assert_eq!(config.opers.len(), 2);
    }

    #[test]
    fn file_parser_skips_comments_and_blanks() {
        let path = write_temp("# a comment\n\nkey = value\nspaced   =   out  \n");
        let values = read_key_values(&path).unwrap();
        assert_eq!(values.get("key").map(String::as_str), Some("value"));
        assert_eq!(values.get("spaced").map(String::as_str), Some("out"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn file_parser_rejects_lines_without_equals() {
        let path = write_temp("key = value\nnot a pair\n");
        let err = read_key_values(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 2, .. }));
    }

    #[test]
    fn load_fails_on_missing_file() {
        let err = Config::load("/nonexistent/tarn.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
