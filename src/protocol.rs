//! Wire protocol definitions - the messages a station fleet speaks
//!
//! Every WebSocket frame is a JSON envelope `{ type, data }`; outbound frames
//! additionally carry `{ epoch, seq, timestamp }` so that receivers can order
//! broadcasts within a playback regime and discard stale ones. The envelope is
//! validated strictly, the `data` payload is extracted defensively field by
//! field: clients of several generations talk to this server and unknown or
//! missing fields must never take a connection down.
//!
//! Field names on the wire keep the historical mixed casing (`trackId`,
//! `ntpTimestamp`, `positionMs`, ...) for interoperability with the deployed
//! clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frames larger than this are dropped before parsing.
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024;

/// Close code sent to a connection displaced by a newer one from the same user
pub const CLOSE_REPLACED: u16 = 4000;
/// Close code for a session that disappeared between upgrade and attach
pub const CLOSE_NOT_FOUND: u16 = 4004;
/// Close code when a session is torn down for inactivity
pub const CLOSE_IDLE: u16 = 4008;
/// Close code when the member cap is reached
pub const CLOSE_FULL: u16 = 4009;

/// Server -> client message type names
pub const STATE_SYNC: &str = "stateSync";
/// Broadcast when a member joins, sent to everyone but the joiner
pub const MEMBER_JOINED: &str = "memberJoined";
/// Broadcast when a member leaves
pub const MEMBER_LEFT: &str = "memberLeft";
/// Broadcast after queue mutations, carries the whole queue
pub const QUEUE_UPDATE: &str = "queueUpdate";
/// Unicast reply to a `ping` probe
pub const PONG: &str = "pong";

/// Opaque track descriptor: a provider-specific id plus whatever denormalized
/// metadata the adding client supplied (title, artists, artwork, ...).
///
/// `durationMs` is the only metadata field the server interprets - it drives
/// the advancement timer. Everything else is relayed untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Provider-specific track id
    pub id: String,

    /// Track length in milliseconds, when the client knew it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    /// Denormalized provider metadata, relayed verbatim
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Track {
    /// Duration usable for scheduling: finite and strictly positive.
    ///
    /// Anything else means the advancement timer must not be armed - a timer
    /// armed with a nonsense delay would drain the whole queue at once.
    pub fn playable_duration(&self) -> Option<f64> {
        self.duration_ms.filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// A queued track annotated with its idempotency nonce and who queued it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// The track itself, flattened into the entry on the wire
    #[serde(flatten)]
    pub track: Track,

    /// Client-supplied idempotency key; retransmissions dedupe on it
    pub nonce: String,

    /// Principal id of the member who queued the track
    pub added_by: String,
}

/// One member as seen in a state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: String,
}

/// Full session state, sufficient for a client to bootstrap or reconcile
/// without any prior context
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub session_id: String,
    pub members: Vec<MemberInfo>,
    pub dj_user_id: String,
    pub current_track: Option<Track>,
    pub is_playing: bool,
    pub position_ms: f64,
    pub position_timestamp: f64,
    pub queue: Vec<QueueEntry>,
    pub epoch: u64,
    pub seq: u64,
}

/// Outbound envelope shared by every server -> client message
#[derive(Debug, Serialize)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Value,
    pub epoch: u64,
    pub seq: u64,
    pub timestamp: f64,
}

/// Validated inbound message, one variant per protocol operation
///
/// Variants keep the raw `data` object where the payload is relayed to other
/// members verbatim (the server is a coordinator, not an interpreter, for
/// fields like `executionTime`).
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Advisory preload hint; relayed so listeners can pre-warm their players
    PlayPrepare { track: Track, raw: Value },

    /// Authoritative "start playing here": anchors the position
    PlayCommit {
        track: Track,
        position_ms: f64,
        ntp_timestamp: Option<f64>,
        raw: Value,
    },

    Pause { raw: Value },

    Resume { raw: Value },

    Seek { position_ms: f64, raw: Value },

    /// Manual advance to the next queued track
    Skip,

    AddToQueue { track: Track, nonce: String },

    RemoveFromQueue { track_id: String },

    /// Position report from a listener, forwarded to the DJ only
    DriftReport { raw: Value },

    /// Clock-sync probe answered with a private `pong`
    Ping { client_send_time: Option<f64> },
}

/// Why an inbound frame was not turned into a [ClientCommand]
#[derive(Debug)]
pub enum DecodeError {
    /// Frame was not a JSON object with a string `type`
    Malformed(String),

    /// Well-formed envelope with a `type` this server does not know.
    /// Tolerated by contract: newer clients may speak newer verbs.
    UnknownType(String),

    /// Envelope was fine but a field the operation cannot do without was
    /// missing or of the wrong shape
    MissingField(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed frame: {err}"),
            Self::UnknownType(kind) => write!(f, "unknown message type {kind:?}"),
            Self::MissingField(field) => write!(f, "missing or invalid field {field:?}"),
        }
    }
}

/// `data` fields that carry control meaning and therefore are not part of a
/// track's relayed metadata
const CONTROL_FIELDS: &[&str] = &[
    "trackId",
    "durationMs",
    "positionMs",
    "ntpTimestamp",
    "nonce",
    "executionTime",
    "clientSendTime",
];

/// Build a [Track] out of a message payload: `trackId` is mandatory, the
/// duration and any metadata travel alongside it in the same object.
fn track_from_payload(data: &Map<String, Value>) -> Option<Track> {
    let id = data.get("trackId")?.as_str()?.to_string();
    let duration_ms = data.get("durationMs").and_then(Value::as_f64);
    let metadata = data
        .iter()
        .filter(|(key, _)| !CONTROL_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(Track {
        id,
        duration_ms,
        metadata,
    })
}

/// Decode one inbound text frame into a [ClientCommand].
///
/// Strict about the envelope, permissive about the payload: every absent
/// numeric field falls back to an explicit default rather than failing the
/// whole frame.
pub fn decode(text: &str) -> Result<ClientCommand, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let Some(envelope) = value.as_object() else {
        return Err(DecodeError::Malformed("frame is not a JSON object".into()));
    };
    let Some(kind) = envelope.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::Malformed("missing string `type`".into()));
    };

    let empty = Map::new();
    let data = envelope
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let raw = || Value::Object(data.clone());

    let command = match kind {
        "playPrepare" => ClientCommand::PlayPrepare {
            track: track_from_payload(data).ok_or(DecodeError::MissingField("trackId"))?,
            raw: raw(),
        },
        "playCommit" => ClientCommand::PlayCommit {
            track: track_from_payload(data).ok_or(DecodeError::MissingField("trackId"))?,
            position_ms: data.get("positionMs").and_then(Value::as_f64).unwrap_or(0.0),
            ntp_timestamp: data.get("ntpTimestamp").and_then(Value::as_f64),
            raw: raw(),
        },
        "pause" => ClientCommand::Pause { raw: raw() },
        "resume" => ClientCommand::Resume { raw: raw() },
        "seek" => ClientCommand::Seek {
            position_ms: data.get("positionMs").and_then(Value::as_f64).unwrap_or(0.0),
            raw: raw(),
        },
        "skip" => ClientCommand::Skip,
        "addToQueue" => ClientCommand::AddToQueue {
            track: track_from_payload(data).ok_or(DecodeError::MissingField("trackId"))?,
            nonce: data
                .get("nonce")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingField("nonce"))?
                .to_string(),
        },
        "removeFromQueue" => ClientCommand::RemoveFromQueue {
            track_id: data
                .get("trackId")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingField("trackId"))?
                .to_string(),
        },
        "driftReport" => ClientCommand::DriftReport { raw: raw() },
        "ping" => ClientCommand::Ping {
            client_send_time: data.get("clientSendTime").and_then(Value::as_f64),
        },
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_play_commit_with_defaults() {
        let frame = json!({
            "type": "playCommit",
            "data": { "trackId": "T1", "durationMs": 180000.0, "title": "Night Drive" }
        });
        let command = decode(&frame.to_string()).unwrap();
        let ClientCommand::PlayCommit {
            track,
            position_ms,
            ntp_timestamp,
            ..
        } = command
        else {
            panic!("expected playCommit");
        };
        assert_eq!(track.id, "T1");
        assert_eq!(track.playable_duration(), Some(180000.0));
        assert_eq!(track.metadata.get("title"), Some(&json!("Night Drive")));
        assert!(!track.metadata.contains_key("trackId"));
        assert_eq!(position_ms, 0.0);
        assert_eq!(ntp_timestamp, None);
    }

    #[test]
    fn missing_duration_is_not_playable() {
        let frame = json!({ "type": "playPrepare", "data": { "trackId": "T2" } });
        let ClientCommand::PlayPrepare { track, .. } = decode(&frame.to_string()).unwrap() else {
            panic!("expected playPrepare");
        };
        assert_eq!(track.playable_duration(), None);

        let zero = Track {
            id: "T0".into(),
            duration_ms: Some(0.0),
            metadata: Map::new(),
        };
        assert_eq!(zero.playable_duration(), None);
    }

    #[test]
    fn unknown_type_is_reported_as_such() {
        let frame = json!({ "type": "interpretiveDance", "data": {} });
        match decode(&frame.to_string()) {
            Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "interpretiveDance"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn garbage_and_envelope_violations_are_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"data":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn add_to_queue_requires_a_nonce() {
        let frame = json!({ "type": "addToQueue", "data": { "trackId": "T3" } });
        assert!(matches!(
            decode(&frame.to_string()),
            Err(DecodeError::MissingField("nonce"))
        ));
    }

    #[test]
    fn snapshot_serializes_with_wire_casing() {
        let snapshot = StateSnapshot {
            session_id: "s".into(),
            members: vec![MemberInfo {
                user_id: "u".into(),
                display_name: "DJ U".into(),
            }],
            dj_user_id: "u".into(),
            current_track: None,
            is_playing: false,
            position_ms: 0.0,
            position_timestamp: 0.0,
            queue: vec![],
            epoch: 3,
            seq: 7,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("djUserId").is_some());
        assert!(value.get("positionTimestamp").is_some());
        assert!(value.get("isPlaying").is_some());
        assert_eq!(value["members"][0]["displayName"], json!("DJ U"));
    }

    #[test]
    fn queue_entry_flattens_track_fields() {
        let entry = QueueEntry {
            track: Track {
                id: "T9".into(),
                duration_ms: Some(1500.0),
                metadata: Map::new(),
            },
            nonce: "n9".into(),
            added_by: "listener".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], json!("T9"));
        assert_eq!(value["durationMs"], json!(1500.0));
        assert_eq!(value["addedBy"], json!("listener"));
    }
}
