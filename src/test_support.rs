//! Helpers for tests that need a fake yt-dlp on disk.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{config::ToolSettings, process::ToolCommand};

/// Writes an executable `/bin/sh` script named `yt-dlp` into `dir`.
pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
    let script_path = dir.join("yt-dlp");
    fs::write(&script_path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

pub fn stub_tool(dir: &Path, body: &str) -> ToolCommand {
    ToolCommand::new(ToolSettings {
        program: install_stub(dir, body),
        probe_timeout: Duration::from_secs(5),
        chunk_size: 4096,
        kill_grace: Duration::from_millis(500),
        ..ToolSettings::default()
    })
}
