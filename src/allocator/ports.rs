//! Port range cursor and port availability probes.
//!
//! Every worker acquisition takes the next block from a [`PortCursor`] and
//! checks the block's two ports with a [`PortProbe`] before handing the
//! worker out.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::PortConfig;

/// A monotonically advancing cursor over a port range.
///
/// Yields the base port of successive `spacing`-wide blocks and wraps back
/// to the start of the range once the next block would not fit.
///
/// # Example
///
/// ```
/// use testfleet::allocator::PortCursor;
///
/// let mut cursor = PortCursor::new(9000, 6, 3);
/// assert_eq!(cursor.next_base(), 9000);
/// assert_eq!(cursor.next_base(), 9003);
/// assert_eq!(cursor.next_base(), 9000);
/// ```
#[derive(Debug, Clone)]
pub struct PortCursor {
    start: u16,
    range: u16,
    spacing: u16,
    next: u16,
}

impl PortCursor {
    /// Spacing below 2 is raised to 2 so the pair never overlaps the next block.
    pub fn new(start: u16, range: u16, spacing: u16) -> Self {
        let spacing = spacing.max(2);
        Self {
            start,
            range: range.max(spacing),
            spacing,
            next: start,
        }
    }

    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.start, config.range, config.spacing)
    }

    /// Returns the next block's base port and advances the cursor.
    pub fn next_base(&mut self) -> u16 {
        let end = u32::from(self.start) + u32::from(self.range);
        if u32::from(self.next) + u32::from(self.spacing) > end
            || u32::from(self.next) + 1 > u32::from(u16::MAX)
        {
            self.next = self.start;
        }
        let base = self.next;
        self.next = self.next.saturating_add(self.spacing);
        base
    }
}

/// Checks whether a local port is free to hand to a test process.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Returns `true` if nothing is listening on `port`.
    async fn is_free(&self, port: u16) -> bool;
}

/// Probes ports over the network.
///
/// First issues an HTTP request to the port to detect an already-running
/// server, such as a leftover automation server from a previous run. When
/// the request fails (connection refused, timeout, non-HTTP listener) it
/// falls back to a raw TCP connect.
pub struct NetworkPortProbe {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
}

impl NetworkPortProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: "127.0.0.1".to_string(),
            timeout,
        })
    }

    async fn tcp_in_use(&self, port: u16) -> bool {
        let addr = format!("{}:{}", self.host, port);
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl PortProbe for NetworkPortProbe {
    async fn is_free(&self, port: u16) -> bool {
        let url = format!("http://{}:{}/wd/hub/status", self.host, port);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                debug!("Port {} answered HTTP {}", port, resp.status());
                false
            }
            Err(e) => {
                if !e.is_connect() {
                    debug!("HTTP probe of port {} failed: {}", port, e);
                }
                !self.tcp_in_use(port).await
            }
        }
    }
}
