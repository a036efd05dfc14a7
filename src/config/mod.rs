use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use directories::BaseDirs;

pub const DEFAULT_MATRIX_MAX_ROWS: usize = 100_000;
pub const DEFAULT_RESTART_NOTICE: &str = "Restarting kernel...";
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    /// Defaults, overlaid by `.varinspectrc`, overlaid by the environment.
    pub fn load() -> Self {
        Self::load_from(default_config_path())
    }

    pub fn load_from(config_path: impl AsRef<Path>) -> Self {
        let config_path = config_path.as_ref().to_path_buf();
        let mut map = default_map();

        if config_path.exists() {
            if let Ok(file) = fs::File::open(&config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(|l| l.ok()) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse::<usize>().ok())
    }

    pub fn matrix_max_rows(&self) -> usize {
        self.get_usize("VARINSPECT_MATRIX_MAX_ROWS")
            .unwrap_or(DEFAULT_MATRIX_MAX_ROWS)
    }

    pub fn restart_notice(&self) -> String {
        self.get("VARINSPECT_RESTART_NOTICE")
            .unwrap_or_else(|| DEFAULT_RESTART_NOTICE.to_string())
    }

    pub fn event_capacity(&self) -> usize {
        // broadcast channels reject a zero capacity
        self.get_usize("VARINSPECT_EVENT_CAPACITY")
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_EVENT_CAPACITY)
    }
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "VARINSPECT_MATRIX_MAX_ROWS",
        "VARINSPECT_RESTART_NOTICE",
        "VARINSPECT_EVENT_CAPACITY",
    ];

    KEYS.contains(&k) || k.starts_with("VARINSPECT_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("varinspect").join(".varinspectrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert(
        "VARINSPECT_MATRIX_MAX_ROWS".into(),
        DEFAULT_MATRIX_MAX_ROWS.to_string(),
    );
    m.insert(
        "VARINSPECT_RESTART_NOTICE".into(),
        DEFAULT_RESTART_NOTICE.into(),
    );
    m.insert(
        "VARINSPECT_EVENT_CAPACITY".into(),
        DEFAULT_EVENT_CAPACITY.to_string(),
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(dir.path().join("absent"));
        if env::var("VARINSPECT_MATRIX_MAX_ROWS").is_err() {
            assert_eq!(cfg.matrix_max_rows(), DEFAULT_MATRIX_MAX_ROWS);
        }
        if env::var("VARINSPECT_RESTART_NOTICE").is_err() {
            assert_eq!(cfg.restart_notice(), DEFAULT_RESTART_NOTICE);
        }
    }

    #[test]
    fn rc_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".varinspectrc");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# tuning").unwrap();
        writeln!(file, "VARINSPECT_TEST_ONLY_KEY = 500").unwrap();
        writeln!(file, "VARINSPECT_EVENT_CAPACITY=0").unwrap();
        writeln!(file, "garbage line").unwrap();

        let cfg = Config::load_from(&path);
        assert_eq!(cfg.get_usize("VARINSPECT_TEST_ONLY_KEY"), Some(500));
        if env::var("VARINSPECT_EVENT_CAPACITY").is_err() {
            assert_eq!(cfg.event_capacity(), DEFAULT_EVENT_CAPACITY);
        }
        assert_eq!(cfg.get("garbage line"), None);
    }
}
