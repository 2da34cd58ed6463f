// geoinv/src/driver/logger.rs

use crate::workspace::artifact_path;
use humantime::{format_duration, format_rfc3339_seconds};
use log::warn;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Default)]
struct Sinks {
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

/// Run progress handle. Lines always reach the console and, while a
/// [`LogSession`] is open, the run log beside the workspace.
#[derive(Clone, Default)]
pub struct InversionLogger {
    sinks: Arc<Mutex<Sinks>>,
}

impl InversionLogger {
    pub const SUFFIX: &'static str = ".inversion.log";

    pub fn console() -> Self {
        Self::default()
    }

    pub fn log_path(workspace: &Path) -> PathBuf {
        artifact_path(workspace, Self::SUFFIX)
    }

    pub fn write_line(&self, message: &str) {
        println!("{}", message);
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(file) = sinks.file.as_mut() {
                let written = writeln!(file, "{}", message).and_then(|_| file.flush());
                if let Err(e) = written {
                    warn!("Could not write to the run log: {}", e);
                }
            }
        }
    }

    /// Path of the open run log, if any.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.sinks.lock().ok().and_then(|sinks| sinks.path.clone())
    }

    /// Open the run log for `workspace` and write the start banner. The
    /// file sink is closed when the returned guard is dropped.
    pub fn session(&self, workspace: &Path, title: &str) -> io::Result<LogSession> {
        let path = Self::log_path(workspace);
        let file = File::create(&path)?;
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.file = Some(BufWriter::new(file));
            sinks.path = Some(path);
        }
        self.write_line(&format!(
            "{} inversion started {}",
            title,
            format_rfc3339_seconds(SystemTime::now())
        ));
        Ok(LogSession {
            logger: self.clone(),
            started: Instant::now(),
        })
    }

    fn detach(&self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(mut file) = sinks.file.take() {
                let _ = file.flush();
            }
            sinks.path = None;
        }
    }
}

pub struct LogSession {
    logger: InversionLogger,
    started: Instant,
}

impl Drop for LogSession {
    fn drop(&mut self) {
        let elapsed = Duration::from_secs(self.started.elapsed().as_secs());
        self.logger
            .write_line(&format!("Total runtime: {}", format_duration(elapsed)));
        self.logger.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_session_writes_banner_and_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("grav.ws.json");
        let logger = InversionLogger::console();
        {
            let _session = logger.session(&workspace, "gravity").unwrap();
            logger.write_line("Setting up 2 tile(s) . . .");
            assert_eq!(logger.log_file(), Some(dir.path().join("grav.inversion.log")));
        }
        logger.write_line("console only");
        assert!(logger.log_file().is_none());

        let text = fs::read_to_string(dir.path().join("grav.inversion.log")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("gravity inversion started"));
        assert_eq!(lines[1], "Setting up 2 tile(s) . . .");
        assert!(lines[2].starts_with("Total runtime:"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_session_closes_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("run.ws.json");
        let logger = InversionLogger::console();
        let failing = || -> Result<(), String> {
            let _session = logger.session(&workspace, "tdem").map_err(|e| e.to_string())?;
            Err("resolver failed".to_string())
        };
        assert!(failing().is_err());
        let text = fs::read_to_string(dir.path().join("run.inversion.log")).unwrap();
        assert!(text.lines().last().unwrap().starts_with("Total runtime:"));
    }
}
