//! SSH-based device verifier. Opens a session with supplied
//! credentials, captures `show version` and the running configuration under
//! a per-command read timeout, then extracts hardware and features. The
//! retry schedule and the failure->stale transition live here as pure
//! functions of a failure count; `InventoryCoordinator::discover_device` is
//! the caller that invokes `verify` and applies them to a device record.

use crate::error::{Error, Result};
use crate::feature_extractor::FeatureExtractor;
use crate::hardware;
use crate::models::{FeatureSnapshot, Platform};
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;
use uuid::Uuid;

/// Minutes between retries after 1st/2nd/3rd consecutive failure. A 4th
/// failure trips the device to `stale`.
pub const RETRY_SCHEDULE_MINUTES: [u64; 4] = [1, 5, 15, 60];
pub const FAILURES_BEFORE_STALE: u32 = 3;

#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub platform: Platform,
    pub version: String,
    pub hardware_model: Option<String>,
    pub feature_snapshot: FeatureSnapshot,
}

pub struct DeviceVerifier<'t> {
    extractor: FeatureExtractor<'t>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl<'t> DeviceVerifier<'t> {
    pub fn new(extractor: FeatureExtractor<'t>, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self { extractor, connect_timeout, command_timeout }
    }

    /// Connects, captures `show version` and the running config, and derives
    /// platform/hardware/features. Credentials are used only for the
    /// authentication call below and are never written to a log line or
    /// returned in the outcome.
    pub fn verify(&self, host: &str, port: u16, platform: Platform, creds: &DeviceCredentials) -> Result<VerifyOutcome> {
        let tcp = TcpStream::connect_timeout(&format!("{host}:{port}").parse().map_err(|_| {
            Error::BadInput(format!("invalid host/port: {host}:{port}"))
        })?, self.connect_timeout)
        .map_err(|e| Error::Upstream(format!("tcp connect failed: {e}")))?;
        tcp.set_read_timeout(Some(self.command_timeout)).ok();

        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&creds.username, &creds.password)?;
        if !session.authenticated() {
            return Err(Error::Upstream("ssh authentication rejected".into()));
        }

        let version_output = self.run_command(&session, "show version")?;
        let config_output = self.run_command(&session, "show running-config")?;

        let hardware_hint = hardware::classify(&version_output).map(|s| s.to_string());
        let snapshot = self.extractor.extract(&config_output, platform, hardware_hint.as_deref());

        let version = extract_version_string(&version_output)
            .ok_or_else(|| Error::Upstream("could not parse version from 'show version' output".into()))?;

        Ok(VerifyOutcome {
            platform,
            version,
            hardware_model: snapshot.hardware_model.clone(),
            feature_snapshot: snapshot,
        })
    }

    fn run_command(&self, session: &ssh2::Session, command: &str) -> Result<String> {
        let mut channel = session.channel_session()?;
        channel.exec(command)?;
        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| Error::Timeout(format!("'{command}' did not complete within the read timeout: {e}")))?;
        channel.wait_close()?;
        Ok(output)
    }
}

/// Pulls a dotted version token out of a `show version` banner. Cisco's own
/// banners vary by platform ("Version 17.10.1", "IOS-XE Software, Version
/// 17.09.04a") so this matches the first token after the word "Version".
fn extract_version_string(show_version_output: &str) -> Option<String> {
    let idx = show_version_output.find("Version ")?;
    let rest = &show_version_output[idx + "Version ".len()..];
    let token = rest.split(|c: char| c.is_whitespace() || c == ',').next()?;
    if token.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        Some(token.to_string())
    } else {
        None
    }
}

/// Given a current `consecutive_failures` count (pre-increment), returns the
/// delay before the next retry attempt, or `None` once the device should be
/// marked `stale` instead of retried automatically.
pub fn next_retry_delay(consecutive_failures: u32) -> Option<Duration> {
    let idx = consecutive_failures as usize;
    RETRY_SCHEDULE_MINUTES.get(idx).map(|m| Duration::from_secs(m * 60))
}

pub fn is_stale(consecutive_failures: u32) -> bool {
    consecutive_failures >= FAILURES_BEFORE_STALE
}

pub fn new_snapshot_id() -> String {
    Uuid::new_v4().to_string()
}
