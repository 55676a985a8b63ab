use crate::backup::pipeline::TaskStage;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::WithMsg;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

static DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);
const BUFFER_SIZE: usize = 64 * 1024;

/// Pass-through stage that counts bytes and periodically logs progress.
///
/// The stream content is forwarded untouched.
#[derive(Clone, Debug)]
pub struct ProgressTap {
    label: Arc<str>,
    expected: Option<u64>,
    interval: Duration,
}

impl ProgressTap {
    pub fn new<L: Into<Arc<str>>>(label: L, expected: Option<u64>) -> Self {
        Self {
            label: label.into(),
            expected,
            interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn into_stage(self) -> TaskStage {
        TaskStage::new("progress", move |input, output| {
            let input = input.ok_or_else(|| {
                Error::from(std::io::Error::other("progress tap needs an upstream stage"))
            })?;
            self.forward(input, output)
                .map(|_| ())
                .map_err(Error::from)
                .with_msg("Progress tap failed")
        })
    }

    /// Copies `reader` into `writer`, returning the number of bytes forwarded.
    pub fn forward<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> std::io::Result<u64> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        let mut last_report = Instant::now();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.write_all(&buf[..n])?;
            total += n as u64;
            if last_report.elapsed() >= self.interval {
                self.report(total);
                last_report = Instant::now();
            }
        }
        writer.flush()?;
        self.report(total);
        Ok(total)
    }

    fn report(&self, total: u64) {
        match self.expected {
            Some(expected) if expected > 0 => tracing::info!(
                "{}: {} / {} ({:.1}%)",
                self.label,
                human_size(total),
                human_size(expected),
                total as f64 * 100.0 / expected as f64
            ),
            _ => tracing::info!("{}: {}", self.label, human_size(total)),
        }
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
