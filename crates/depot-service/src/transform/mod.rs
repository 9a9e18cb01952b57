//! Runs the external program that derives images from their source files.
//!
//! The program is configured as a list of arguments with placeholders, see
//! [`ImagesConfig::args`](crate::config::ImagesConfig::args). Arguments that consist of exactly
//! `{source}` or `{output}` are passed as paths, everything else is passed as a string with
//! `{max_side}` and `{quality}` substituted.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::caching::{CacheContents, CacheError};
use crate::config::ImagesConfig;

/// The maximum amount of `stderr` output included in logs.
const MAX_STDERR_LEN: usize = 1024;

/// Invokes the configured transform program.
#[derive(Debug, Clone)]
pub struct TransformService {
    program: String,
    args: Vec<String>,
    quality: u8,
    timeout: Duration,
}

impl TransformService {
    pub fn new(config: &ImagesConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            quality: config.quality,
            timeout: config.timeout,
        }
    }

    /// Builds the argument list for one invocation.
    fn args(&self, source: &Path, output: &Path, max_side: u32) -> Vec<OsString> {
        let max_side = max_side.to_string();
        let quality = self.quality.to_string();

        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                "{source}" => source.as_os_str().to_owned(),
                "{output}" => output.as_os_str().to_owned(),
                arg => arg
                    .replace("{max_side}", &max_side)
                    .replace("{quality}", &quality)
                    .into(),
            })
            .collect()
    }

    /// Transforms the image at `source` to fit into `max_side`, writing it to `output`.
    ///
    /// The process is killed if it does not finish within the configured timeout.
    ///
    /// # Errors
    ///
    /// A program that cannot be started or exits unsuccessfully results in
    /// [`CacheError::TransformFailed`]. Its `stderr` output is logged, but not returned.
    pub async fn transform(&self, source: &Path, output: &Path, max_side: u32) -> CacheContents {
        let args = self.args(source, output, max_side);
        tracing::debug!(
            program = %self.program,
            "Transforming `{}` to max side {max_side}",
            source.display()
        );

        let start = Instant::now();
        let result = self.run(args).await;
        metric!(
            timer("transform.duration") = start.elapsed(),
            "status" => match &result {
                Ok(_) => "ok",
                Err(err) => err.metrics_tag(),
            },
        );

        if let Err(CacheError::TransformFailed(details)) = &result {
            tracing::error!(
                program = %self.program,
                details = %details,
                "Failed to transform `{}`",
                source.display()
            );
        }
        result
    }

    async fn run(&self, args: Vec<OsString>) -> CacheContents {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CacheError::TransformFailed(format!("failed to start: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CacheError::Timeout(self.timeout))??;

        if output.status.success() {
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.len() > MAX_STDERR_LEN {
            let mut end = MAX_STDERR_LEN;
            while !stderr.is_char_boundary(end) {
                end -= 1;
            }
            stderr.truncate(end);
        }
        Err(CacheError::TransformFailed(format!(
            "{}: {}",
            output.status,
            stderr.trim()
        )))
    }
}
