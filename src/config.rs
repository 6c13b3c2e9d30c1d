use std::env;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub vt_bound: bool,
    pub loglevel: String,
}

impl Config {
    /// Load the optional config file, then apply environment overrides
    /// (`SEATD_SOCK`, `SEATD_VTBOUND`, `SEATD_LOGLEVEL`).
    pub fn new() -> Self {
        let mut config = match config_path() {
            None => Self::default(),
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).expect("could not read the config file");
                toml_edit::de::from_str(&contents).expect("config error")
            }
        };
        if let Some(path) = env::var_os("SEATD_SOCK") {
            config.socket_path = path.into();
        }
        if let Ok(vt_bound) = env::var("SEATD_VTBOUND") {
            config.vt_bound = vt_bound != "0";
        }
        if let Ok(loglevel) = env::var("SEATD_LOGLEVEL") {
            config.loglevel = loglevel;
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/seatd.sock"),
            vt_bound: true,
            loglevel: String::from("info"),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    let path = env::var_os("SEATMUX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/seatmux/config.toml"));
    path.exists().then_some(path)
}
