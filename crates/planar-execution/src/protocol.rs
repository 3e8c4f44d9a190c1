//! Versioned frames exchanged between execution units and their host.
//!
//! Both sides depend only on these shapes, never on each other's types.
//! Every frame is wrapped in an envelope carrying the protocol version:
//!
//! ```text
//! {"version":1,"frame":{"type":"call","seq":3,"request":{"method":"append_log","payload":{"text":"hi"}}}}
//! ```
//!
//! On process transports each envelope is one line of JSON.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::ProtocolError;
use crate::failure::FailureInfo;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A unit-to-host request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "snake_case")]
pub enum Request {
    AppendLog {
        text: String,
    },
    UpdateProgress {
        current: i64,
        total: i64,
    },
    SetEffectedRows {
        value: i64,
    },
    IncreaseEffectedRows,
    PutJobData {
        key: String,
        value: String,
    },
    RemoveJobData {
        key: String,
    },
    AddAggregateException {
        failure: FailureInfo,
        #[serde(default)]
        tolerance_seconds: u32,
    },
    CheckAggregateException,
    ReportFatal {
        failure: FailureInfo,
    },
    GetLog,
    IsStopRequested,
}

impl Request {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Request::AppendLog { .. } => "append_log",
            Request::UpdateProgress { .. } => "update_progress",
            Request::SetEffectedRows { .. } => "set_effected_rows",
            Request::IncreaseEffectedRows => "increase_effected_rows",
            Request::PutJobData { .. } => "put_job_data",
            Request::RemoveJobData { .. } => "remove_job_data",
            Request::AddAggregateException { .. } => "add_aggregate_exception",
            Request::CheckAggregateException => "check_aggregate_exception",
            Request::ReportFatal { .. } => "report_fatal",
            Request::GetLog => "get_log",
            Request::IsStopRequested => "is_stop_requested",
        }
    }
}

/// The host's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    /// The mutation was applied.
    Ack,
    /// The mutation arrived after finalization and was discarded.
    Dropped { reason: String },
    /// Progress after an update.
    Progress { value: u8 },
    /// Effected rows after an increase.
    Rows { value: i64 },
    /// Current log text.
    Log { text: String },
    /// Current stop flag.
    StopRequested { value: bool },
    /// The request turned the run into a failure (aggregate check).
    Failed { failure: FailureInfo },
    /// The host could not process the request.
    Error { message: String },
}

/// Facts resolved once when a unit starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupSnapshot {
    pub context: ExecutionContext,
    pub log: String,
    pub stop_requested: bool,
    pub global_config: BTreeMap<String, String>,
}

/// A request addressed to the host's handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub fire_instance_id: String,
    pub seq: u64,
    pub request: Request,
}

/// The handler's answer to a [`CallFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub seq: u64,
    pub reply: Reply,
}

/// Frames the host writes to a child process's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Start { snapshot: StartupSnapshot },
    Reply { seq: u64, reply: Reply },
}

/// Frames a child process writes to its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitFrame {
    Call { seq: u64, request: Request },
    /// Optional explicit completion. Without it, the exit status decides.
    Completed {
        #[serde(default)]
        failure: Option<FailureInfo>,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u16,
    frame: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u16,
}

/// Encode a frame as one line of JSON (without the trailing newline).
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        frame,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode one line of JSON, checking the protocol version first.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let probe: VersionProbe = serde_json::from_str(line)?;
    if probe.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: probe.version,
            expected: PROTOCOL_VERSION,
        });
    }
    let envelope: Envelope<T> = serde_json::from_str(line)?;
    Ok(envelope.frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_shape() {
        let line = encode(&UnitFrame::Call {
            seq: 3,
            request: Request::AppendLog {
                text: "hi".to_string(),
            },
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"version":1,"frame":{"type":"call","seq":3,"request":{"method":"append_log","payload":{"text":"hi"}}}}"#
        );
    }

    #[test]
    fn test_unit_request_without_payload_decodes() {
        let frame: UnitFrame = decode(
            r#"{"version":1,"frame":{"type":"call","seq":1,"request":{"method":"increase_effected_rows"}}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            UnitFrame::Call {
                seq: 1,
                request: Request::IncreaseEffectedRows
            }
        );
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let err = decode::<UnitFrame>(r#"{"version":2,"frame":{"type":"completed"}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion {
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn test_unknown_method_is_malformed() {
        let err = decode::<UnitFrame>(
            r#"{"version":1,"frame":{"type":"call","seq":1,"request":{"method":"format_disk"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_aggregate_tolerance_defaults_to_zero() {
        let frame: UnitFrame = decode(
            r#"{"version":1,"frame":{"type":"call","seq":9,"request":{"method":"add_aggregate_exception","payload":{"failure":{"kind":"error","message":"row 7"}}}}}"#,
        )
        .unwrap();
        match frame {
            UnitFrame::Call {
                request:
                    Request::AddAggregateException {
                        failure,
                        tolerance_seconds,
                    },
                ..
            } => {
                assert_eq!(failure.message, "row 7");
                assert_eq!(tolerance_seconds, 0);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_completed_without_failure() {
        let frame: UnitFrame = decode(r#"{"version":1,"frame":{"type":"completed"}}"#).unwrap();
        assert_eq!(frame, UnitFrame::Completed { failure: None });
    }
}
