// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport that delegates the device protocol to a sidecar process.
//!
//! The sidecar (for example a small node script wrapping the vendor library)
//! receives the device credentials in its environment and speaks
//! newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! -> {"id":1,"method":"set","params":{"dps":1,"value":true}}
//! <- {"id":1,"result":true}
//! <- {"event":"data","dps":{"1":true}}
//! ```
//!
//! Requests are matched to responses by id. Lines that carry an `event` field
//! are published as [`TransportEvent`]s.

use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{DeviceTransport, DpsUpdate, EventBus, TransportEvent};
use crate::config::DeviceConfig;
use crate::error::{ConfigError, TransportError};
use crate::types::Dps;

/// The command line used to start the bridge process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
}

impl BridgeCommand {
    /// Creates a command that runs `program` without arguments.
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Parses a whitespace-separated command line such as `node bridge.js`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` if the line names no program.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let mut words = line.split_whitespace();
        let program = words.next().ok_or(ConfigError::MissingField("bridge command"))?;
        Ok(words.fold(Self::new(program), Self::with_arg))
    }

    /// Appends an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the bridge.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Passes the device identity to the bridge.
    ///
    /// Sets `DEVICE_ID`, `DEVICE_KEY`, `DEVICE_VERSION` and, when a static
    /// address is configured, `DEVICE_IP`.
    #[must_use]
    pub fn for_device(self, device: &DeviceConfig) -> Self {
        let command = self
            .with_env("DEVICE_ID", device.id())
            .with_env("DEVICE_KEY", device.local_key())
            .with_env("DEVICE_VERSION", device.version().as_str());

        match device.ip() {
            Some(ip) => command.with_env("DEVICE_IP", ip.to_string()),
            None => command,
        }
    }

    /// Returns the program that is executed.
    #[must_use]
    pub fn program(&self) -> &OsString {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum BridgeEvent {
    Connected,
    Disconnected,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Data {
        #[serde(default)]
        dps: DpsUpdate,
    },
}

impl From<BridgeEvent> for TransportEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Connected => Self::Connected,
            BridgeEvent::Disconnected => Self::Disconnected,
            BridgeEvent::Error { message } => {
                Self::Error(message.unwrap_or_else(|| "unspecified bridge error".to_string()))
            }
            BridgeEvent::Data { dps } => Self::Data(dps),
        }
    }
}

fn parse_line(line: &str) -> Result<Incoming, TransportError> {
    Ok(serde_json::from_str(line)?)
}

fn codec_error(err: LinesCodecError) -> TransportError {
    match err {
        LinesCodecError::Io(err) => TransportError::Io(err),
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::Protocol("line length limit exceeded".to_string())
        }
    }
}

type Reply = Result<Value, TransportError>;

struct PendingRequest {
    generation: u64,
    method: &'static str,
    reply: oneshot::Sender<Reply>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

/// Removes a pending request when its caller stops waiting.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct Running {
    child: Child,
    stdin: FramedWrite<ChildStdin, LinesCodec>,
    generation: u64,
    alive: Arc<AtomicBool>,
}

impl Running {
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst) && matches!(self.child.try_wait(), Ok(None))
    }
}

/// JSON-lines RPC client for a bridge process.
///
/// The process is spawned on first use and respawned on the next request
/// after it exits.
pub struct BridgeTransport {
    command: BridgeCommand,
    process: tokio::sync::Mutex<Option<Running>>,
    pending: PendingMap,
    next_id: AtomicU64,
    generations: AtomicU64,
    events: EventBus,
}

impl BridgeTransport {
    /// Creates a transport that runs `command` on demand.
    #[must_use]
    pub fn new(command: BridgeCommand) -> Self {
        Self {
            command,
            process: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            generations: AtomicU64::new(0),
            events: EventBus::new(),
        }
    }

    /// Returns `true` while a bridge process is running.
    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_mut()
            .is_some_and(Running::is_alive)
    }

    fn spawn(&self) -> Result<Running, TransportError> {
        let mut child = self.command.to_command().spawn()?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;
        let stderr = child.stderr.take().ok_or(TransportError::Closed)?;

        info!(
            program = ?self.command.program(),
            pid = child.id(),
            generation,
            "Bridge process started"
        );

        let alive = Arc::new(AtomicBool::new(true));
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let reader_alive = Arc::clone(&alive);

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());

            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to read bridge output");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parse_line(&line) {
                    Ok(Incoming::Response { id, result, error }) => {
                        let Some(request) = pending.lock().remove(&id) else {
                            debug!(id, "Dropping reply for abandoned request");
                            continue;
                        };
                        let reply = match error {
                            Some(message) => Err(TransportError::Rpc {
                                method: request.method.to_string(),
                                message,
                            }),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = request.reply.send(reply);
                    }
                    Ok(Incoming::Event(event)) => events.publish(event.into()),
                    Err(e) => warn!(error = %e, line = %line, "Ignoring malformed bridge output"),
                }
            }

            reader_alive.store(false, Ordering::SeqCst);

            let orphaned: Vec<PendingRequest> = {
                let mut pending = pending.lock();
                let ids: Vec<u64> = pending
                    .iter()
                    .filter(|(_, request)| request.generation == generation)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| pending.remove(&id))
                    .collect()
            };
            for request in orphaned {
                let _ = request.reply.send(Err(TransportError::Closed));
            }

            warn!(generation, "Bridge output closed");
            events.publish(TransportEvent::Disconnected);
        });

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                warn!(target: "plugd::bridge", "{line}");
            }
        });

        Ok(Running {
            child,
            stdin: FramedWrite::new(stdin, LinesCodec::new()),
            generation,
            alive,
        })
    }

    async fn call(&self, method: &'static str, params: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&Request { id, method, params })?;
        let (tx, rx) = oneshot::channel();

        let _guard = {
            let mut process = self.process.lock().await;
            if !process.as_mut().is_some_and(Running::is_alive) {
                *process = Some(self.spawn()?);
            }
            let Some(running) = process.as_mut() else {
                return Err(TransportError::Closed);
            };

            self.pending.lock().insert(
                id,
                PendingRequest {
                    generation: running.generation,
                    method,
                    reply: tx,
                },
            );
            let guard = PendingGuard {
                pending: Arc::clone(&self.pending),
                id,
            };

            debug!(id, method, "Sending bridge request");
            running.stdin.send(line).await.map_err(codec_error)?;
            guard
        };

        rx.await.unwrap_or(Err(TransportError::Closed))
    }
}

impl std::fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("command", &self.command)
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceTransport for BridgeTransport {
    async fn find(&self) -> Result<(), TransportError> {
        self.call("find", json!({})).await.map(drop)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.call("connect", json!({})).await.map(drop)
    }

    async fn get(&self, dps: Dps) -> Result<Value, TransportError> {
        self.call("get", json!({ "dps": dps.value() })).await
    }

    async fn set(&self, dps: Dps, value: Value) -> Result<Option<Value>, TransportError> {
        let ack = self
            .call("set", json!({ "dps": dps.value(), "value": value }))
            .await?;
        Ok((!ack.is_null()).then_some(ack))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let running = {
            let mut process = self.process.lock().await;
            process.as_mut().is_some_and(Running::is_alive)
        };
        if !running {
            return Ok(());
        }
        self.call("disconnect", json!({})).await.map(drop)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceConfig {
        DeviceConfig::new("bf01", "Q~]w6H7u=H=aVXQV").unwrap()
    }

    #[test]
    fn request_serializes_id_first() {
        let line = serde_json::to_string(&Request {
            id: 7,
            method: "get",
            params: json!({ "dps": 1 }),
        })
        .unwrap();
        assert_eq!(line, r#"{"id":7,"method":"get","params":{"dps":1}}"#);
    }

    #[test]
    fn parses_responses() {
        match parse_line(r#"{"id":3,"result":true}"#).unwrap() {
            Incoming::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert_eq!(result, Some(Value::Bool(true)));
                assert!(error.is_none());
            }
            Incoming::Event(_) => panic!("expected a response"),
        }

        match parse_line(r#"{"id":4,"error":"timeout"}"#).unwrap() {
            Incoming::Response { error, .. } => assert_eq!(error.as_deref(), Some("timeout")),
            Incoming::Event(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn parses_events() {
        let event = match parse_line(r#"{"event":"data","dps":{"1":false}}"#).unwrap() {
            Incoming::Event(event) => TransportEvent::from(event),
            Incoming::Response { .. } => panic!("expected an event"),
        };
        assert_eq!(
            event,
            TransportEvent::Data(DpsUpdate::new().with(Dps::POWER, Value::Bool(false)))
        );

        let event = match parse_line(r#"{"event":"error","message":"socket hang up"}"#).unwrap() {
            Incoming::Event(event) => TransportEvent::from(event),
            Incoming::Response { .. } => panic!("expected an event"),
        };
        assert_eq!(event, TransportEvent::Error("socket hang up".to_string()));
    }

    #[test]
    fn rejects_unknown_lines() {
        assert!(parse_line(r#"{"event":"reboot"}"#).is_err());
        assert!(parse_line("Connected to device!").is_err());
    }

    #[test]
    fn device_environment() {
        let command = BridgeCommand::new("node")
            .with_arg("bridge.js")
            .for_device(&device().with_ip("10.0.0.9".parse().unwrap()));

        assert!(command.env.contains(&("DEVICE_ID".to_string(), "bf01".to_string())));
        assert!(command.env.contains(&("DEVICE_VERSION".to_string(), "3.4".to_string())));
        assert!(command.env.contains(&("DEVICE_IP".to_string(), "10.0.0.9".to_string())));

        let command = BridgeCommand::new("node").for_device(&device());
        assert!(!command.env.iter().any(|(key, _)| key == "DEVICE_IP"));
    }

    #[test]
    fn parses_command_line() {
        let command = BridgeCommand::parse("  node  scripts/bridge.js --verbose ").unwrap();
        assert_eq!(command.program(), "node");
        assert_eq!(command.args, vec![OsString::from("scripts/bridge.js"), OsString::from("--verbose")]);

        assert_eq!(
            BridgeCommand::parse("   "),
            Err(ConfigError::MissingField("bridge command"))
        );
    }

    #[cfg(unix)]
    fn shell(script: &str) -> BridgeTransport {
        BridgeTransport::new(BridgeCommand::new("sh").with_arg("-c").with_arg(script))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn round_trip_through_process() {
        let transport = shell(
            r#"while read -r line; do
                 id=$(echo "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
                 echo "{\"id\":$id,\"result\":true}"
               done"#,
        );

        assert_eq!(transport.get(Dps::POWER).await.unwrap(), Value::Bool(true));
        assert_eq!(
            transport.set(Dps::POWER, Value::Bool(true)).await.unwrap(),
            Some(Value::Bool(true))
        );
        assert!(transport.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_output_fails_pending_requests() {
        let transport = shell("read -r line; exit 0");
        let mut events = transport.subscribe();

        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disconnect_without_process_is_noop() {
        let transport = shell("exit 1");
        transport.disconnect().await.unwrap();
        assert!(!transport.is_running().await);
    }
}
