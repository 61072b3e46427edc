//! `systemd-analyze` boot timing.
//!
//! ```text
//! Startup finished in 3.802s (firmware) + 4.318s (loader) + 5.291s (kernel) + 2min 2.026s (userspace) = 2min 15.437s
//! graphical.target reached after 2min 1.998s in userspace
//! ```
//!
//! Only the text between the prefix and the first `=` is read. Each `+` term
//! is either `<n>s <label>` or `<m>min <n>s <label>`; labels that do not
//! appear are 0.0.

use crate::error::ParseError;
use crate::records::MetricRecord;

const PREFIX: &str = "Startup finished in ";

#[derive(Debug, Default)]
struct Phases {
    firmware: f64,
    loader: f64,
    kernel: f64,
    userspace: f64,
}

impl Phases {
    fn add(&mut self, label: &str, seconds: f64) -> Result<(), ParseError> {
        let slot = match label {
            "firmware" => &mut self.firmware,
            "loader" => &mut self.loader,
            // initramfs time is reported against the kernel phase
            "kernel" | "initrd" => &mut self.kernel,
            "userspace" => &mut self.userspace,
            other => {
                return Err(ParseError::MalformedTimingOutput(format!(
                    "unknown boot phase '{}'",
                    other
                )))
            }
        };
        *slot += seconds;
        Ok(())
    }
}

pub fn parse_boot_timing(content: &str) -> Result<MetricRecord, ParseError> {
    let start = content.find(PREFIX).ok_or_else(|| {
        ParseError::MalformedTimingOutput(format!("missing '{}'", PREFIX.trim_end()))
    })?;
    let summary = &content[start + PREFIX.len()..];
    let summary = summary.split('=').next().unwrap_or_default();

    let mut phases = Phases::default();
    for term in summary.split('+') {
        let term = term.replace(['(', ')'], "");
        let tokens: Vec<&str> = term.split_whitespace().collect();
        let (seconds, label) = match tokens.as_slice() {
            [value, label] => (duration_token(value)?, *label),
            [minutes, value, label] => (
                minutes_token(minutes)? * 60.0 + duration_token(value)?,
                *label,
            ),
            _ => {
                return Err(ParseError::MalformedTimingOutput(format!(
                    "unexpected term '{}'",
                    term.trim()
                )))
            }
        };
        phases.add(label, seconds)?;
    }

    MetricRecord::boot(phases.firmware, phases.loader, phases.kernel, phases.userspace)
}

fn number(token: &str, raw: &str) -> Result<f64, ParseError> {
    token
        .parse::<f64>()
        .map_err(|_| ParseError::MalformedTimingOutput(format!("bad duration '{}'", raw)))
}

/// `2.026s` or `850ms`, in seconds.
fn duration_token(token: &str) -> Result<f64, ParseError> {
    if let Some(ms) = token.strip_suffix("ms") {
        return Ok(number(ms, token)? / 1000.0);
    }
    match token.strip_suffix('s') {
        Some(seconds) => number(seconds, token),
        None => Err(ParseError::MalformedTimingOutput(format!(
            "bad duration '{}'",
            token
        ))),
    }
}

fn minutes_token(token: &str) -> Result<f64, ParseError> {
    match token.strip_suffix("min") {
        Some(minutes) => number(minutes, token),
        None => Err(ParseError::MalformedTimingOutput(format!(
            "bad minutes '{}'",
            token
        ))),
    }
}
