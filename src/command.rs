//! Command vocabulary and response decoding.
//!
//! The control protocol accepts a small, fixed set of operations. Each
//! constructor validates its arguments before anything touches the
//! network, so a bad call never produces wire traffic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Virtual gamepad device name the emulator exposes for input injection.
///
/// The device is created out-of-band (or negotiated by the host setup);
/// this client only references it by name.
pub const DEFAULT_GAMEPAD_DEVICE: &str = "usb-xbox-gamepad";

/// One operation to issue against the control socket.
///
/// Wire shape: `{"execute": <name>, "arguments": {...}}`. Immutable once
/// constructed; `arguments` is always present, even when empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    execute: String,
    arguments: Map<String, Value>,
}

impl Command {
    fn bare(name: &str) -> Self {
        Self {
            execute: name.to_string(),
            arguments: Map::new(),
        }
    }

    fn with_arguments(name: &str, arguments: Value) -> Self {
        let Value::Object(arguments) = arguments else {
            unreachable!("command arguments are always built as an object");
        };
        Self {
            execute: name.to_string(),
            arguments,
        }
    }

    /// Operation name, as sent on the wire.
    pub fn name(&self) -> &str {
        &self.execute
    }

    /// Query whether the emulator is running or paused.
    pub fn status() -> Self {
        Self::bare("query-status")
    }

    /// Pause emulation.
    pub fn pause() -> Self {
        Self::bare("stop")
    }

    /// Resume emulation.
    pub fn resume() -> Self {
        Self::bare("cont")
    }

    /// Reset the virtual machine.
    pub fn reset() -> Self {
        Self::bare("system_reset")
    }

    /// The one-time capability handshake, sent right after the greeting.
    pub(crate) fn negotiate_capabilities() -> Self {
        Self::bare("qmp_capabilities")
    }

    /// Ask the emulator to capture a screenshot into `path` on its side.
    pub fn screenshot(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "screenshot destination path is empty".into(),
            ));
        }
        Ok(Self::with_arguments(
            "screendump",
            json!({ "filename": path }),
        ))
    }

    /// Pass a human-monitor command line through verbatim.
    pub fn human_monitor(line: &str) -> Result<Self> {
        if line.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "human-monitor command line is empty".into(),
            ));
        }
        Ok(Self::with_arguments(
            "human-monitor-command",
            json!({ "command-line": line }),
        ))
    }

    /// Dump `len` bytes of guest memory starting at `addr`.
    ///
    /// Issued through the human-monitor passthrough; decode the text reply
    /// with [`decode_memory_dump`].
    pub fn read_memory(addr: u64, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("memory read length is zero".into()));
        }
        Self::human_monitor(&format!("x /{len}xb {addr}"))
    }

    /// Inject a keyboard key press held for `hold_ms` milliseconds.
    pub fn send_key(symbol: &str, hold_ms: i64) -> Result<Self> {
        if symbol.trim().is_empty() {
            return Err(Error::InvalidArgument("key symbol is empty".into()));
        }
        if hold_ms < 0 {
            return Err(Error::InvalidArgument(format!(
                "key hold time must be non-negative, got {hold_ms}"
            )));
        }
        Ok(Self::with_arguments(
            "send-key",
            json!({
                "keys": [ { "type": "qcode", "data": symbol } ],
                "hold-time": hold_ms,
            }),
        ))
    }

    /// Inject a gamepad button press or release on the named device.
    pub fn button_event(device: &str, button: &str, down: bool) -> Result<Self> {
        if device.trim().is_empty() {
            return Err(Error::InvalidArgument("input device name is empty".into()));
        }
        if button.trim().is_empty() {
            return Err(Error::InvalidArgument("button identifier is empty".into()));
        }
        Ok(Self::with_arguments(
            "input-send-event",
            json!({
                "device": device,
                "events": [ {
                    "type": "btn",
                    "data": { "button": button, "down": down },
                } ],
            }),
        ))
    }
}

/// Error descriptor the peer attaches to a rejected command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandError {
    pub class: String,
    pub desc: String,
}

/// Decoded reply to one command: a success value or an error descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Value),
    Error(CommandError),
}

impl Response {
    /// Decode a wire message as a call response.
    ///
    /// A response carries a `return` field on success or an `error`
    /// descriptor on failure; anything else is a protocol violation.
    pub fn decode(message: Value) -> Result<Self> {
        let Value::Object(mut fields) = message else {
            return Err(Error::Protocol(format!(
                "response is not an object: {message}"
            )));
        };
        if let Some(value) = fields.remove("return") {
            return Ok(Self::Success(value));
        }
        if let Some(descriptor) = fields.remove("error") {
            let error: CommandError = serde_json::from_value(descriptor)
                .map_err(|e| Error::Protocol(format!("malformed error descriptor: {e}")))?;
            return Ok(Self::Error(error));
        }
        Err(Error::Protocol(
            "response carries neither a return value nor an error".into(),
        ))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// Convert a peer error descriptor into [`Error::CommandFailed`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Error(CommandError { class, desc }) => Err(Error::CommandFailed { class, desc }),
        }
    }
}

/// Emulator run state, as reported by the status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Other(String),
}

impl RunState {
    /// Extract the run state from a status success value.
    pub fn from_return(value: &Value) -> Result<Self> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("status reply without a status field: {value}")))?;
        Ok(match status {
            "running" => Self::Running,
            "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused)
    }
}

/// Decode a human-monitor memory dump into the bytes it describes.
///
/// Dump lines look like `0x1000: 41 42 0a`; the address-offset prefix up
/// to `": "` is stripped and the remaining whitespace-separated tokens are
/// parsed as hex bytes (`0x` prefix tolerated). Lines without an address
/// prefix carry no data and are skipped.
pub fn decode_memory_dump(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some((_, data)) = line.split_once(": ") else {
            continue;
        };
        for token in data.split_whitespace() {
            let digits = token.strip_prefix("0x").unwrap_or(token);
            let byte = u8::from_str_radix(digits, 16).map_err(|_| {
                Error::MalformedDump(format!("token {token:?} is not a hex byte"))
            })?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_commands_serialize_with_empty_arguments() {
        let json = serde_json::to_string(&Command::pause()).unwrap();
        assert_eq!(json, r#"{"execute":"stop","arguments":{}}"#);

        assert_eq!(Command::status().name(), "query-status");
        assert_eq!(Command::resume().name(), "cont");
        assert_eq!(Command::reset().name(), "system_reset");
    }

    #[test]
    fn send_key_roundtrip() {
        let cmd = Command::send_key("return", 250).unwrap();
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "execute": "send-key",
                "arguments": {
                    "keys": [ { "type": "qcode", "data": "return" } ],
                    "hold-time": 250,
                },
            })
        );

        let response = Response::decode(serde_json::json!({"return": {}})).unwrap();
        let ack = response.into_result().unwrap();
        assert_eq!(ack, serde_json::json!({}));
    }

    #[test]
    fn send_key_rejects_bad_arguments() {
        assert!(matches!(
            Command::send_key("", 250),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::send_key("a", -1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Command::send_key("a", 0).is_ok());
    }

    #[test]
    fn button_event_shape() {
        let cmd = Command::button_event(DEFAULT_GAMEPAD_DEVICE, "0", true).unwrap();
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["execute"], "input-send-event");
        assert_eq!(wire["arguments"]["device"], "usb-xbox-gamepad");
        assert_eq!(wire["arguments"]["events"][0]["data"]["down"], true);

        assert!(matches!(
            Command::button_event("", "0", true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::button_event("pad", " ", true),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn screenshot_requires_a_path() {
        assert!(Command::screenshot("shot.ppm").is_ok());
        assert!(matches!(
            Command::screenshot("  "),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_memory_builds_a_dump_command() {
        let cmd = Command::read_memory(0x1000, 4).unwrap();
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["execute"], "human-monitor-command");
        assert_eq!(wire["arguments"]["command-line"], "x /4xb 4096");

        assert!(matches!(
            Command::read_memory(0x1000, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn decode_success_and_error_responses() {
        let ok = Response::decode(serde_json::json!({"return": {"status": "running"}})).unwrap();
        assert_eq!(
            ok.value().unwrap(),
            &serde_json::json!({"status": "running"})
        );

        let err = Response::decode(serde_json::json!({
            "error": { "class": "CommandNotFound", "desc": "no such command" }
        }))
        .unwrap();
        match err.into_result() {
            Err(Error::CommandFailed { class, desc }) => {
                assert_eq!(class, "CommandNotFound");
                assert_eq!(desc, "no such command");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_shapeless_responses() {
        assert!(matches!(
            Response::decode(serde_json::json!({"neither": true})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Response::decode(serde_json::json!([1, 2])),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn run_state_from_status_reply() {
        let paused = RunState::from_return(&serde_json::json!({"status": "paused"})).unwrap();
        assert!(paused.is_paused());

        let running = RunState::from_return(&serde_json::json!({"status": "running"})).unwrap();
        assert_eq!(running, RunState::Running);

        assert!(matches!(
            RunState::from_return(&serde_json::json!({})),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn memory_dump_decodes_rows() {
        let text = "0x1000: 41 42 0a\n0x1004: ff";
        assert_eq!(decode_memory_dump(text).unwrap(), vec![0x41, 0x42, 0x0a, 0xff]);
    }

    #[test]
    fn memory_dump_tolerates_carriage_returns_and_prefixes() {
        let text = "0x1000: 0x41 0x42\r\n0x1002: 0x43\r\n";
        assert_eq!(decode_memory_dump(text).unwrap(), vec![0x41, 0x42, 0x43]);
    }

    #[test]
    fn memory_dump_rejects_non_hex_tokens() {
        let err = decode_memory_dump("0x1000: 41 zz").unwrap_err();
        assert!(matches!(err, Error::MalformedDump(_)));
    }

    #[test]
    fn memory_dump_skips_lines_without_an_address_prefix() {
        // The monitor may echo status text around the dump rows.
        let text = "dumping memory\n0x1000: 01 02";
        assert_eq!(decode_memory_dump(text).unwrap(), vec![0x01, 0x02]);
    }
}
