use std::env::var_os;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use keyirq::DriverConfig;
use log::warn;

const DEFAULT_CONFIG_FILE: &str = "keyirq.json";

/// Gets the path of the config file, `KEYIRQ_CONFIG` or `keyirq.json`.
pub fn config_path() -> PathBuf {
    let path = var_os("KEYIRQ_CONFIG").unwrap_or_else(|| OsString::from(DEFAULT_CONFIG_FILE));
    PathBuf::from(path)
}

pub fn try_load(path: &Path) -> Option<DriverConfig> {
    if !path.exists() {
        return None;
    }
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    match serde_json::from_reader(reader) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!("Ignoring malformed config {}: {}", path.display(), err);
            None
        }
    }
}

pub fn save(config: &DriverConfig, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, config)?;
    Ok(())
}
