// State file writer for external monitoring
//!
//! Writes the current session phase to a file for consumption by external
//! tools (status bars, health checks). Best-effort: callers log failures at
//! warn level and carry on.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

const STATE_FILE: &str = "/run/wifi-hooks/state";
const STATE_DIR: &str = "/run/wifi-hooks";

/// Write the session phase and SSID to the default state file
pub fn write_state(phase: &str, ssid: Option<&str>) -> Result<()> {
    let state_dir = Path::new(STATE_DIR);
    if !state_dir.exists() {
        fs::create_dir_all(state_dir).context("Failed to create state directory")?;
    }
    write_state_to(Path::new(STATE_FILE), phase, ssid)
}

/// Write the session phase and SSID to the given path
pub fn write_state_to(path: &Path, phase: &str, ssid: Option<&str>) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let content = format!(
        "STATE={}\nSSID={}\nTIMESTAMP={}\n",
        phase,
        ssid.unwrap_or(""),
        timestamp
    );

    fs::write(path, content).context("Failed to write state file")?;
    Ok(())
}

/// Remove the state file on shutdown
pub fn cleanup() {
    let _ = fs::remove_file(STATE_FILE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_file_format() {
        let path = std::env::temp_dir().join(format!(
            "wifi-hooks-state-{}",
            std::process::id()
        ));

        write_state_to(&path, "watching", Some("HomeWiFi")).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "STATE=watching");
        assert_eq!(lines[1], "SSID=HomeWiFi");
        assert!(lines[2].starts_with("TIMESTAMP="));

        write_state_to(&path, "stopped", None).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("STATE=stopped"));
        assert!(content.contains("SSID=\n"));

        let _ = fs::remove_file(&path);
    }
}
