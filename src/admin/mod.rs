//! Proxy administrative interface polling.
//!
//! # Responsibilities
//! - Read named counters from the admin `/stats` endpoint
//! - Wait for a counter to reach a threshold (the signal that configuration
//!   took effect, e.g. a listener was created)
//! - Read bound listener addresses for port registration
//!
//! # Design Decisions
//! - Counter waits poll; there is no push channel on the admin surface. The
//!   poll loop is bounded by the harness wait timeout

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::dispatch::DEFAULT_WAIT_TIMEOUT;
use crate::error::{HarnessError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Client for the proxy's administrative listener.
pub struct AdminClient {
    base: Url,
    http: reqwest::Client,
    wait_timeout: Option<Duration>,
}

impl AdminClient {
    pub fn new(admin_port: u16, wait_timeout: Option<Duration>) -> Result<Self> {
        let base = Url::parse(&format!("http://127.0.0.1:{admin_port}/"))
            .map_err(|err| HarnessError::Admin(err.to_string()))?;
        Ok(Self {
            base,
            http: reqwest::Client::new(),
            wait_timeout,
        })
    }

    /// Fetch one named counter from `/stats`.
    ///
    /// The stats endpoint is line-oriented text, `name: value` per line.
    pub async fn counter(&self, name: &str) -> Result<u64> {
        let url = self
            .base
            .join("stats")
            .map_err(|err| HarnessError::Admin(err.to_string()))?;
        let body = self.http.get(url).send().await?.text().await?;
        parse_counter(&body, name)
    }

    /// Poll until `name` reaches at least `value`.
    pub async fn wait_for_counter_ge(&self, name: &str, value: u64) -> Result<()> {
        let deadline = self
            .wait_timeout
            .or(Some(DEFAULT_WAIT_TIMEOUT))
            .map(|t| Instant::now() + t);
        loop {
            match self.counter(name).await {
                Ok(current) if current >= value => return Ok(()),
                Ok(current) => {
                    tracing::trace!(name, current, target = value, "counter below threshold")
                }
                // The admin listener may not be up yet; keep polling.
                Err(err) => tracing::trace!(name, error = %err, "counter poll failed"),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(HarnessError::WaitTimeout {
                        what: "admin counter threshold",
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll `/listeners` until the proxy reports at least `count` bound
    /// addresses, returning them in listener declaration order.
    pub async fn wait_for_listener_count(&self, count: usize) -> Result<Vec<SocketAddr>> {
        let deadline = self
            .wait_timeout
            .or(Some(DEFAULT_WAIT_TIMEOUT))
            .map(|t| Instant::now() + t);
        loop {
            match self.listeners().await {
                Ok(addresses) if addresses.len() >= count => return Ok(addresses),
                Ok(addresses) => {
                    tracing::trace!(bound = addresses.len(), target = count, "listeners pending")
                }
                // The admin listener may not be up yet; keep polling.
                Err(err) => tracing::trace!(error = %err, "listener poll failed"),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(HarnessError::WaitTimeout {
                        what: "proxy listener creation",
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Fetch the bound listener addresses from `/listeners` (a JSON array of
    /// `"ip:port"` strings, in listener declaration order).
    pub async fn listeners(&self) -> Result<Vec<SocketAddr>> {
        let url = self
            .base
            .join("listeners")
            .map_err(|err| HarnessError::Admin(err.to_string()))?;
        let body = self.http.get(url).send().await?.text().await?;
        let addresses: Vec<String> = serde_json::from_str(&body)
            .map_err(|err| HarnessError::Admin(format!("bad listeners payload: {err}")))?;
        addresses
            .iter()
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .map_err(|_| HarnessError::Admin(format!("bad listener address {address:?}")))
            })
            .collect()
    }
}

fn parse_counter(stats: &str, name: &str) -> Result<u64> {
    for line in stats.lines() {
        let Some((line_name, value)) = line.split_once(':') else {
            continue;
        };
        if line_name.trim() == name {
            return value
                .trim()
                .parse::<u64>()
                .map_err(|_| HarnessError::Admin(format!("unparseable counter {name}")));
        }
    }
    // Counters are created on first increment; absent means zero.
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_counter_lines() {
        let stats = "listeners.created: 2\nhttp.ingress.rq_total: 17\n";
        assert_eq!(parse_counter(stats, "listeners.created").unwrap(), 2);
        assert_eq!(parse_counter(stats, "http.ingress.rq_total").unwrap(), 17);
    }

    #[test]
    fn absent_counter_reads_as_zero() {
        assert_eq!(parse_counter("a: 1\n", "missing").unwrap(), 0);
    }
}
