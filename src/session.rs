//! Session lifecycle over the framed transport.
//!
//! A session owns exactly one connection to the control endpoint. It is
//! only usable after the peer's greeting has been consumed and the
//! capability handshake accepted; once closed it stays closed, and
//! reconnecting means constructing a new session.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::command::{Command, Response};
use crate::config::{Endpoint, RetryPolicy};
use crate::error::{Error, Result};
use crate::transport::FramedTransport;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Closed,
}

/// First message the peer sends after connect.
///
/// Carries version information, consumed exactly once per session and
/// logged informationally; no compatibility validation is performed.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub info: GreetingInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingInfo {
    #[serde(default)]
    pub version: Option<VersionInfo>,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub qemu: Option<VersionTriple>,
    #[serde(default)]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

impl Greeting {
    /// Human-readable peer version, for logs.
    pub fn version_label(&self) -> String {
        match &self.info.version {
            Some(VersionInfo {
                qemu: Some(v),
                package,
            }) => {
                let base = format!("{}.{}.{}", v.major, v.minor, v.micro);
                match package.as_deref().map(str::trim) {
                    Some(pkg) if !pkg.is_empty() => format!("{base} ({pkg})"),
                    _ => base,
                }
            }
            Some(_) | None => "unknown".to_string(),
        }
    }
}

/// One established control connection.
///
/// `call` takes `&mut self`, so a second call cannot start before the
/// first one's response is read — the protocol's half-duplex discipline
/// is enforced by the borrow checker rather than at runtime.
#[derive(Debug)]
pub struct Session<S = TcpStream> {
    transport: FramedTransport<S>,
    endpoint: Endpoint,
    greeting: Greeting,
    state: SessionState,
    call_timeout: Option<Duration>,
}

impl Session<TcpStream> {
    /// Connect to the control endpoint, retrying refused attempts.
    ///
    /// Covers the window where the emulator process is up but has not
    /// opened its control listener yet. Fails with
    /// [`Error::SessionUnavailable`] once `retry.max_attempts` attempts
    /// are exhausted.
    pub async fn connect(endpoint: &Endpoint, retry: &RetryPolicy) -> Result<Self> {
        let max_attempts = retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            debug!(endpoint = %endpoint, attempt, "Connecting to control endpoint");
            match FramedTransport::open(endpoint).await {
                Ok(transport) => return Self::establish(transport, endpoint.clone()).await,
                Err(e) => {
                    warn!(endpoint = %endpoint, attempt, error = %e, "Connection attempt failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }
        Err(Error::SessionUnavailable {
            endpoint: endpoint.to_string(),
            attempts: max_attempts,
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Run the protocol handshake on an open transport: consume the
    /// greeting, then negotiate capabilities. Only a session that made it
    /// through both is Ready.
    pub async fn establish(mut transport: FramedTransport<S>, endpoint: Endpoint) -> Result<Self> {
        // Connecting: the first message on the wire is the greeting.
        let raw = transport.read_message().await?;
        let greeting: Greeting = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("invalid greeting: {e}")))?;
        info!(
            endpoint = %endpoint,
            version = %greeting.version_label(),
            "Received control greeting"
        );

        // Negotiating: the handshake must be accepted before any other
        // command; a rejection is fatal to the session.
        transport
            .write_message(&Command::negotiate_capabilities())
            .await?;
        let response = read_response(&mut transport).await?;
        if let Response::Error(e) = response {
            transport.close().await;
            return Err(Error::Negotiation {
                class: e.class,
                desc: e.desc,
            });
        }
        debug!(endpoint = %endpoint, "Capabilities negotiated");

        Ok(Self {
            transport,
            endpoint,
            greeting,
            state: SessionState::Ready,
            call_timeout: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Bound the response wait of each call. Off by default: the protocol
    /// itself has no read deadline, so a silent peer blocks the caller.
    pub fn set_call_timeout(&mut self, timeout: Option<Duration>) {
        self.call_timeout = timeout;
    }

    /// Issue one command and read its response.
    ///
    /// Valid only while Ready. Exactly one response is consumed per
    /// command; a transport failure mid-call closes the session.
    pub async fn call(&mut self, command: &Command) -> Result<Response> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState {
                expected: SessionState::Ready,
                actual: self.state,
            });
        }

        debug!(command = command.name(), "Issuing command");
        let result = self.call_inner(command).await;
        if let Err(e) = &result {
            match e {
                Error::Disconnected | Error::TruncatedStream { .. } | Error::Connection(_) => {
                    warn!(command = command.name(), error = %e, "Call failed, closing session");
                    self.close().await;
                }
                _ => {}
            }
        }
        result
    }

    async fn call_inner(&mut self, command: &Command) -> Result<Response> {
        self.transport.write_message(command).await?;
        match self.call_timeout {
            None => read_response(&mut self.transport).await,
            Some(limit) => tokio::time::timeout(limit, read_response(&mut self.transport))
                .await
                .map_err(|_| {
                    Error::Protocol(format!(
                        "no response to {} within {limit:?}",
                        command.name()
                    ))
                })?,
        }
        .map_err(|e| match e {
            Error::TruncatedStream { .. } => Error::Disconnected,
            other => other,
        })
    }

    /// Release the connection. Idempotent, and reachable from every exit
    /// path of a session's lifetime.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transport.close().await;
        self.state = SessionState::Closed;
        debug!(endpoint = %self.endpoint, "Session closed");
    }
}

/// Read messages until one is a call response.
///
/// The peer may emit unsolicited event notifications on the same stream;
/// those carry an `event` field and are never matched against a command,
/// so they are logged and skipped here.
async fn read_response<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut FramedTransport<S>,
) -> Result<Response> {
    loop {
        let message = transport.read_message().await?;
        if let Some(event) = message.get("event").and_then(Value::as_str) {
            debug!(event, "Ignoring asynchronous event");
            continue;
        }
        return Response::decode(message);
    }
}
