//! Session recording in terminal-cast v2 format: one JSON header line,
//! then one JSON event line per read or write, timestamped relative to
//! session start.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

/// Event direction for client input.
pub const DIR_INPUT: &str = "i";
/// Event direction for child output.
pub const DIR_OUTPUT: &str = "o";

#[derive(Serialize)]
struct CastHeader<'a> {
    version: u8,
    width: u32,
    height: u32,
    timestamp: i64,
    env: CastEnv<'a>,
}

#[derive(Serialize)]
struct CastEnv<'a> {
    #[serde(rename = "TERM")]
    term: &'a str,
}

/// A live recording. Writes are serialized under a mutex so concurrently
/// pumped input and output lines never interleave mid-line. After the
/// first write failure the recording goes inert and the session carries on.
pub struct Recording {
    start: Instant,
    path: PathBuf,
    out: Mutex<Option<File>>,
}

impl Recording {
    /// Create `<dir>/ssh-session-<unixnano>-<5 hex>.cast` (the directory is
    /// created mode 0700 if missing) and write the v2 header.
    pub fn create(dir: &Path, width: u32, height: u32, term: &str) -> Result<Self> {
        let now = Utc::now();
        create_private_dir(dir)?;

        let rnd: [u8; 5] = rand::random();
        let hex: String = rnd.iter().map(|b| format!("{b:02x}")).collect();
        let path = dir.join(format!(
            "ssh-session-{}-{hex}.cast",
            now.timestamp_nanos_opt().unwrap_or_default()
        ));
        let mut file = open_private_file(&path)
            .with_context(|| format!("creating recording file: {}", path.display()))?;

        let header = CastHeader {
            version: 2,
            width,
            height,
            timestamp: now.timestamp(),
            env: CastEnv { term },
        };
        let mut line = serde_json::to_vec(&header).context("encoding cast header")?;
        line.push(b'\n');
        file.write_all(&line)
            .with_context(|| format!("writing cast header: {}", path.display()))?;

        Ok(Self {
            start: Instant::now(),
            path,
            out: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line. `dir` is [`DIR_INPUT`] or [`DIR_OUTPUT`].
    pub fn record(&self, dir: &str, data: &[u8]) {
        let event = serde_json::json!([
            self.start.elapsed().as_secs_f64(),
            dir,
            String::from_utf8_lossy(data),
        ]);
        let mut line = event.to_string().into_bytes();
        line.push(b'\n');

        let mut guard = self.out.lock().expect("recording lock poisoned");
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(&line) {
            warn!(path = %self.path.display(), error = %e, "recording write failed; stopping recording");
            *guard = None;
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !dir.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("creating recording dir: {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating recording dir: {}", dir.display()))
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}
