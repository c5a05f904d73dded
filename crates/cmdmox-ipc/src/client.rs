// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Blocking client used by the launcher.
//!
//! Each request is one connection: connect (with bounded retries and
//! linear-with-jitter backoff), send a single JSON line, read a single JSON
//! line back. Connect, send, and receive each honor the per-operation
//! timeout.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use cmdmox_proto::{
    decode_line, encode_line, Invocation, PassthroughResult, Response, WireRequest, WireResponse,
};

use crate::{Endpoint, Result, TransportError};

/// Floor for retry sleeps, so jitter can never produce a zero-length nap.
pub const MIN_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Connection retry policy.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total connection attempts (not additional retries).
    pub retries: u32,
    /// Base delay; attempt *n* sleeps `backoff * (n + 1)`.
    pub backoff: Duration,
    /// Fractional jitter applied to each delay, `0.0..1.0`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(50),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(TransportError::InvalidConfig(
                "retries must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(TransportError::InvalidConfig(format!(
                "jitter must be within [0.0, 1.0), got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Sleep duration before retrying after 0-based *attempt*.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.as_secs_f64() * f64::from(attempt + 1);
        let delay = if self.jitter > 0.0 {
            // Randomize within the jitter bounds so simultaneous launchers
            // do not retry in lockstep.
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            base * factor
        } else {
            base
        };
        Duration::from_secs_f64(delay).max(MIN_RETRY_SLEEP)
    }
}

/// Send *invocation* to the IPC server and return its response.
pub fn invoke_server(
    endpoint: &Endpoint,
    invocation: &Invocation,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<Response> {
    send_request(
        endpoint,
        &WireRequest::Invocation(invocation.clone()),
        timeout,
        retry,
    )
}

/// Report a passthrough execution's outcome and await the final response.
pub fn report_passthrough_result(
    endpoint: &Endpoint,
    result: &PassthroughResult,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<Response> {
    send_request(
        endpoint,
        &WireRequest::PassthroughResult(result.clone()),
        timeout,
        retry,
    )
}

fn send_request(
    endpoint: &Endpoint,
    request: &WireRequest,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<Response> {
    crate::validate_timeout(timeout)?;
    retry.validate()?;

    let mut stream = connect_with_retries(endpoint, timeout, retry)?;
    let payload = encode_line(request)?;
    stream
        .write_all(&payload)
        .and_then(|()| stream.flush())
        .map_err(|err| map_timeout(err, timeout))?;

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let read = reader
        .read_until(b'\n', &mut line)
        .map_err(|err| map_timeout(err, timeout))?;
    if read == 0 {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "IPC server closed the connection without responding",
        )));
    }

    match decode_line::<WireResponse>(&line)? {
        WireResponse::Response(response) => Ok(response),
    }
}

fn map_timeout(err: std::io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            TransportError::Timeout(timeout)
        }
        _ => TransportError::Io(err),
    }
}

#[cfg(unix)]
type ClientStream = std::os::unix::net::UnixStream;

#[cfg(unix)]
fn connect_once(endpoint: &Endpoint, timeout: Duration) -> std::io::Result<ClientStream> {
    let stream = std::os::unix::net::UnixStream::connect(endpoint.logical_path())?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

#[cfg(windows)]
type ClientStream = std::fs::File;

#[cfg(windows)]
fn connect_once(endpoint: &Endpoint, _timeout: Duration) -> std::io::Result<ClientStream> {
    // Duplex byte-mode pipes are plain files from the client side.
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(endpoint.pipe_name())
}

fn connect_with_retries(
    endpoint: &Endpoint,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<ClientStream> {
    let mut last_err = None;
    for attempt in 0..retry.retries {
        match connect_once(endpoint, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(
                    attempt = attempt + 1,
                    total = retry.retries,
                    path = %endpoint.logical_path().display(),
                    %err,
                    "IPC connect attempt failed"
                );
                last_err = Some(err);
                if attempt + 1 < retry.retries {
                    std::thread::sleep(retry.retry_delay(attempt));
                }
            }
        }
    }
    Err(TransportError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "no connection attempts made")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_linearly() {
        let retry = RetryConfig {
            retries: 3,
            backoff: Duration::from_millis(50),
            jitter: 0.0,
        };
        assert_eq!(retry.retry_delay(0), Duration::from_millis(50));
        assert_eq!(retry.retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry.retry_delay(2), Duration::from_millis(150));
    }

    #[test]
    fn retry_delay_never_drops_below_minimum() {
        let retry = RetryConfig {
            retries: 1,
            backoff: Duration::ZERO,
            jitter: 0.0,
        };
        assert_eq!(retry.retry_delay(0), MIN_RETRY_SLEEP);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let retry = RetryConfig {
            retries: 1,
            backoff: Duration::from_millis(100),
            jitter: 0.2,
        };
        for _ in 0..64 {
            let delay = retry.retry_delay(0);
            assert!(delay >= Duration::from_millis(80), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(120), "delay {delay:?}");
        }
    }

    #[test]
    fn invalid_retry_config_is_rejected() {
        let retry = RetryConfig {
            retries: 0,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            jitter: 1.5,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn missing_endpoint_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("nope.sock"));
        let retry = RetryConfig {
            retries: 2,
            backoff: Duration::from_millis(1),
            jitter: 0.0,
        };
        let err = invoke_server(
            &endpoint,
            &Invocation::new("x", Vec::new(), "", Default::default(), "id"),
            Duration::from_millis(100),
            &retry,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
