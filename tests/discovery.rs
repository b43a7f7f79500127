// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP round trips against a discovery responder on localhost.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use plugd::config::DiscoveryConfig;
use plugd::discovery::DiscoveryResponder;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MARKER: &str = DiscoveryConfig::DEFAULT_MARKER;

async fn start() -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
    let responder =
        DiscoveryResponder::bind_addr((Ipv4Addr::LOCALHOST, 0).into(), MARKER).unwrap();
    let addr = responder.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(responder.run(shutdown.clone()));
    (addr, shutdown, task)
}

async fn probe(target: SocketAddr, payload: &[u8]) -> Option<String> {
    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    client.send_to(payload, target).await.unwrap();

    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => {
            assert_eq!(from, target);
            Some(String::from_utf8(buf[..len].to_vec()).unwrap())
        }
        Ok(Err(e)) => panic!("receive failed: {e}"),
        Err(_) => None,
    }
}

#[tokio::test]
async fn probe_with_marker_gets_ipv4_reply() {
    let (addr, _shutdown, _task) = start().await;

    let reply = probe(addr, MARKER.as_bytes()).await.expect("no reply");

    assert!(reply.parse::<Ipv4Addr>().is_ok(), "{reply}");
}

#[tokio::test]
async fn marker_may_be_embedded() {
    let (addr, _shutdown, _task) = start().await;

    let reply = probe(addr, b"hello PLUGD_DISCOVER v2").await;

    assert!(reply.is_some());
}

#[tokio::test]
async fn probe_without_marker_is_ignored() {
    let (addr, _shutdown, _task) = start().await;

    assert_eq!(probe(addr, b"who is there?").await, None);
    // The responder keeps serving after ignoring a datagram
    assert!(probe(addr, MARKER.as_bytes()).await.is_some());
}

#[tokio::test]
async fn responder_stops_on_shutdown() {
    let (addr, shutdown, task) = start().await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("responder did not stop")
        .unwrap();

    assert_eq!(probe(addr, MARKER.as_bytes()).await, None);
}

#[tokio::test]
async fn custom_marker_is_honoured() {
    let config = DiscoveryConfig::new(0, "FIND_MY_PLUG").unwrap();
    let responder =
        DiscoveryResponder::bind_addr((Ipv4Addr::LOCALHOST, config.port).into(), &config.marker)
            .unwrap();
    let addr = responder.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(responder.run(shutdown.clone()));

    assert_eq!(probe(addr, MARKER.as_bytes()).await, None);
    assert!(probe(addr, b"FIND_MY_PLUG").await.is_some());
    shutdown.cancel();
}
