// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: transfer :: tool  —  external DFU transfer program
//
//  The packet-level DFU protocol lives in a separate program. This
//  supervisor prepares the image files, invokes that program and turns its
//  output into progress callbacks:
//
//    stdout line ending in "NN%"  → progress value
//    any other stdout line        → progress text
//    exit status 0                → success
//    anything else                → error (stderr as detail)
//
//  Argument template placeholders: {device} {firmware} {init}. Arguments
//  mentioning {init} are dropped when the image has no init packet.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{ProgressSink, TransferError, TransferTask, UpdateSupervisor};
use crate::config::TransferSettings;
use crate::device::DeviceHandle;
use crate::select::{ImageRef, UpdateImage};

#[derive(Debug, Clone)]
pub struct ToolSupervisor {
    program: Option<String>,
    args:    Vec<String>,
}

impl ToolSupervisor {
    pub fn new(program: Option<String>, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self::new(settings.program.clone(), settings.args.clone())
    }
}

#[async_trait]
impl UpdateSupervisor for ToolSupervisor {
    async fn start(
        &self,
        device: &DeviceHandle,
        image: &UpdateImage,
        sink: ProgressSink,
    ) -> Result<TransferTask, TransferError> {
        let program = self
            .program
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or(TransferError::NotConfigured)?;

        let job = Job {
            program,
            template: self.args.clone(),
            device:   device.clone(),
            image:    image.clone(),
        };
        // Stopping the task drops the child, and kill_on_drop ends the tool.
        Ok(TransferTask::spawn(job.run(sink)))
    }
}

struct Job {
    program:  String,
    template: Vec<String>,
    device:   DeviceHandle,
    image:    UpdateImage,
}

impl Job {
    async fn run(self, sink: ProgressSink) {
        // The temp dir must outlive the child process.
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return sink.error("Could not create a working directory", Some(e.to_string())),
        };

        let firmware = match stage(&self.image.firmware, self.image.sha256.as_deref(), workdir.path(), "firmware", &sink).await {
            Ok(path) => path,
            Err(e) => return sink.error(e, None),
        };
        let init = match &self.image.init {
            Some(init) => match stage(init, None, workdir.path(), "init", &sink).await {
                Ok(path) => Some(path),
                Err(e) => return sink.error(e, None),
            },
            None => None,
        };

        let args = expand_args(&self.template, &self.device, &firmware, init.as_deref());
        log::debug!("running {} {:?}", self.program, args);

        let mut child = match Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return sink.error(format!("Transfer tool not found: {}", self.program), Some(e.to_string()));
            }
            Err(e) => {
                return sink.error(format!("Could not start {}", self.program), Some(e.to_string()));
            }
        };

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_percent(line) {
                    Some(fraction) => sink.value(fraction),
                    None => sink.text(line),
                }
            }
        }

        let status = child.wait().await;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let detail = Some(stderr.trim().to_owned()).filter(|s| !s.is_empty());

        match status {
            Ok(status) if status.success() => sink.success(),
            Ok(status) => sink.error(format!("Transfer failed: {} exited with {}", self.program, status), detail),
            Err(e) => sink.error(format!("Transfer failed: {}", e), detail),
        }
    }
}

/// Make an image available as a local file, downloading it if needed.
async fn stage(
    image: &ImageRef,
    sha256: Option<&str>,
    dir: &Path,
    stem: &str,
    sink: &ProgressSink,
) -> Result<PathBuf, String> {
    let path = match image {
        ImageRef::Path(path) => {
            if !path.is_file() {
                return Err(format!("Firmware file not found: {}", path.display()));
            }
            path.clone()
        }
        ImageRef::Url(url) => {
            sink.text(format!("Downloading {}", url));
            let dest = dir.join(file_name_for(url, stem));
            let (url, target) = (url.clone(), dest.clone());
            tokio::task::spawn_blocking(move || download(&url, &target))
                .await
                .map_err(|e| format!("Download task failed: {}", e))??;
            dest
        }
    };

    if let Some(expected) = sha256 {
        verify_checksum(&path, expected)?;
    }
    Ok(path)
}

fn download(url: &str, dest: &Path) -> Result<(), String> {
    let resp = ureq::get(url)
        .call()
        .map_err(|e| format!("Download of {} failed: {}", url, e))?;
    let mut reader = resp.into_reader();
    let mut file = fs::File::create(dest)
        .map_err(|e| format!("Cannot write {}: {}", dest.display(), e))?;
    io::copy(&mut reader, &mut file)
        .map_err(|e| format!("Download of {} failed: {}", url, e))?;
    Ok(())
}

fn file_name_for(url: &str, stem: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{}.bin", stem))
}

/// Accepts a bare hex digest or the `SHA-256:` prefixed registry form.
fn verify_checksum(path: &Path, expected: &str) -> Result<(), String> {
    let data = fs::read(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    let actual = hex::encode(Sha256::digest(&data));
    let expected = expected.trim();
    let expected = expected.strip_prefix("SHA-256:").unwrap_or(expected);

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(format!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        ))
    }
}

fn expand_args(
    template: &[String],
    device: &DeviceHandle,
    firmware: &Path,
    init: Option<&Path>,
) -> Vec<String> {
    template
        .iter()
        .filter(|arg| init.is_some() || !arg.contains("{init}"))
        .map(|arg| {
            let mut arg = arg
                .replace("{device}", &device.id.to_string())
                .replace("{firmware}", &firmware.display().to_string());
            if let Some(init) = init {
                arg = arg.replace("{init}", &init.display().to_string());
            }
            arg
        })
        .collect()
}

/// `"Uploading... 42%"` → `Some(0.42)`.
fn parse_percent(line: &str) -> Option<f64> {
    let body = line.strip_suffix('%')?.trim_end();
    let prefix = body.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    let number: f64 = body[prefix.len()..].parse().ok()?;
    Some(number / 100.0)
}
