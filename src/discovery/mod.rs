// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LAN discovery responder.
//!
//! Clients find the daemon by broadcasting a UDP datagram that contains the
//! marker string. The responder answers each such probe, unicast to the
//! sender, with this host's IPv4 address as plain text. Datagrams without the
//! marker are ignored without a reply.
//!
//! # Examples
//!
//! ```no_run
//! use plugd::config::DiscoveryConfig;
//! use plugd::discovery::DiscoveryResponder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> std::io::Result<()> {
//! let responder = DiscoveryResponder::bind(&DiscoveryConfig::default())?;
//! let shutdown = CancellationToken::new();
//!
//! tokio::spawn(responder.run(shutdown.clone()));
//! // ...
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use local_ip_address::list_afinet_netifas;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;

/// Largest probe that is inspected; longer datagrams are truncated.
const MAX_PROBE_LEN: usize = 1024;

const RECV_RETRY_MIN: Duration = Duration::from_millis(50);
const RECV_RETRY_MAX: Duration = Duration::from_secs(5);

/// Pause after a failed receive, doubling with each consecutive failure.
#[derive(Debug, Default)]
struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    fn failed(&mut self) -> Duration {
        let delay = RECV_RETRY_MIN
            .saturating_mul(1 << self.failures.min(10))
            .min(RECV_RETRY_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Answers discovery probes on a UDP port.
#[derive(Debug)]
pub struct DiscoveryResponder {
    socket: UdpSocket,
    marker: String,
}

impl DiscoveryResponder {
    /// Binds the responder on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn bind(config: &DiscoveryConfig) -> io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        Self::bind_addr(addr, &config.marker)
    }

    /// Binds the responder on a specific address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn bind_addr(addr: SocketAddr, marker: &str) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!(addr = %socket.local_addr()?, marker, "Discovery responder listening");

        Ok(Self {
            socket,
            marker: marker.to_string(),
        })
    }

    /// Returns the address the responder is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answers probes until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = [0u8; MAX_PROBE_LEN];
        let mut backoff = RecvBackoff::default();

        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => {
                    backoff.reset();
                    received
                }
                Err(e) => {
                    let delay = backoff.failed();
                    warn!(
                        error = %e,
                        failures = backoff.failures,
                        retry_ms = delay.as_millis(),
                        "Discovery receive failed"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let Some(reply) = respond_to(&buf[..len], &self.marker) else {
                continue;
            };

            debug!(%peer, %reply, "Answering discovery probe");
            if let Err(e) = self.socket.send_to(reply.as_bytes(), peer).await {
                warn!(%peer, error = %e, "Discovery reply failed");
            }
        }

        info!("Discovery responder stopped");
    }
}

/// Returns the reply for a probe, or `None` if it lacks the marker.
#[must_use]
pub fn respond_to(payload: &[u8], marker: &str) -> Option<String> {
    String::from_utf8_lossy(payload)
        .contains(marker)
        .then(|| local_ipv4().to_string())
}

/// Returns the first non-loopback IPv4 address of this host.
///
/// Falls back to `127.0.0.1` when no such interface exists.
#[must_use]
pub fn local_ipv4() -> Ipv4Addr {
    list_afinet_netifas()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        })
        .into_iter()
        .find_map(|(_, addr)| match addr {
            IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_payload_without_marker() {
        assert_eq!(respond_to(b"hello", "PLUGD_DISCOVER"), None);
        assert_eq!(respond_to(b"", "PLUGD_DISCOVER"), None);
        assert_eq!(respond_to(b"plugd_discover", "PLUGD_DISCOVER"), None);
    }

    #[test]
    fn receive_failures_back_off() {
        let mut backoff = RecvBackoff::default();

        assert_eq!(backoff.failed(), Duration::from_millis(50));
        assert_eq!(backoff.failed(), Duration::from_millis(100));
        assert_eq!(backoff.failed(), Duration::from_millis(200));
        for _ in 0..20 {
            backoff.failed();
        }
        assert_eq!(backoff.failed(), RECV_RETRY_MAX);

        backoff.reset();
        assert_eq!(backoff.failed(), Duration::from_millis(50));
    }

    #[test]
    fn answers_payload_containing_marker() {
        let reply = respond_to(b"v1 PLUGD_DISCOVER please", "PLUGD_DISCOVER").unwrap();
        assert!(reply.parse::<Ipv4Addr>().is_ok());
    }
}
