//! Typed model of the ARI events the engine consumes.
//!
//! Anything not listed here deserializes to [`AriEvent::Unknown`] and is
//! ignored by the engine.

use std::collections::HashMap;

use serde::Deserialize;

/// Caller identification on a channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// An Asterisk channel as it appears in events and command responses.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    /// Channel variables exposed by commands such as externalMedia
    /// (notably `UNICASTRTP_LOCAL_PORT`).
    #[serde(default)]
    pub channelvars: HashMap<String, serde_json::Value>,
}

impl Channel {
    /// The local RTP port Asterisk allocated for an external-media channel.
    pub fn unicast_rtp_local_port(&self) -> Option<u16> {
        let value = self.channelvars.get("UNICASTRTP_LOCAL_PORT")?;
        match value {
            serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// A playback object referenced by `PlaybackFinished`.
#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub target_uri: String,
}

/// A mixing bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub bridge_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Events delivered over the ARI WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    /// A channel entered our Stasis application: a new call (or one of our
    /// own media legs coming up).
    StasisStart {
        #[serde(default)]
        timestamp: String,
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A channel left our application.
    StasisEnd {
        #[serde(default)]
        timestamp: String,
        channel: Channel,
    },
    /// A channel ceased to exist.
    ChannelDestroyed {
        #[serde(default)]
        timestamp: String,
        channel: Channel,
    },
    /// A playback we started has finished.
    PlaybackFinished {
        #[serde(default)]
        timestamp: String,
        playback: Playback,
    },
    /// Channel state transition (ringing, up, ...).
    ChannelStateChange {
        #[serde(default)]
        timestamp: String,
        channel: Channel,
    },
    /// DTMF digit received. Logged only; IVR menus are out of scope.
    ChannelDtmfReceived {
        #[serde(default)]
        timestamp: String,
        channel: Channel,
        #[serde(default)]
        digit: String,
    },
    /// Any event type the engine does not consume.
    #[serde(other)]
    Unknown,
}

impl AriEvent {
    /// Key used to deduplicate redelivered events across WebSocket
    /// reconnects. None when the event carries no identity.
    pub fn dedup_key(&self) -> Option<String> {
        let (kind, ts, id) = match self {
            Self::StasisStart {
                timestamp, channel, ..
            } => ("StasisStart", timestamp, &channel.id),
            Self::StasisEnd { timestamp, channel } => ("StasisEnd", timestamp, &channel.id),
            Self::ChannelDestroyed { timestamp, channel } => {
                ("ChannelDestroyed", timestamp, &channel.id)
            }
            Self::PlaybackFinished {
                timestamp,
                playback,
            } => ("PlaybackFinished", timestamp, &playback.id),
            Self::ChannelStateChange { timestamp, channel } => {
                ("ChannelStateChange", timestamp, &channel.id)
            }
            Self::ChannelDtmfReceived {
                timestamp, channel, ..
            } => ("ChannelDtmfReceived", timestamp, &channel.id),
            Self::Unknown => return None,
        };
        if ts.is_empty() {
            return None;
        }
        Some(format!("{kind}:{ts}:{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stasis_start_parses_channel_and_args() {
        let json = r#"{
            "type": "StasisStart",
            "timestamp": "2025-03-01T12:00:00.000+0000",
            "args": ["default"],
            "channel": {
                "id": "1709294400.17",
                "name": "PJSIP/alice-00000011",
                "state": "Ring",
                "caller": {"name": "Alice", "number": "100"}
            }
        }"#;
        let event: AriEvent = serde_json::from_str(json).unwrap();
        match event {
            AriEvent::StasisStart { channel, args, .. } => {
                assert_eq!(channel.id, "1709294400.17");
                assert_eq!(channel.caller.number, "100");
                assert_eq!(args, vec!["default"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_types_parse_to_unknown() {
        let json = r#"{"type": "ChannelVarset", "variable": "X", "value": "1"}"#;
        let event: AriEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, AriEvent::Unknown));
    }

    #[test]
    fn external_media_port_reads_string_or_number() {
        let mut channel = Channel {
            id: "x".to_string(),
            name: String::new(),
            state: String::new(),
            caller: CallerId::default(),
            channelvars: HashMap::new(),
        };
        channel.channelvars.insert(
            "UNICASTRTP_LOCAL_PORT".to_string(),
            serde_json::Value::String("10500".to_string()),
        );
        assert_eq!(channel.unicast_rtp_local_port(), Some(10500));

        channel.channelvars.insert(
            "UNICASTRTP_LOCAL_PORT".to_string(),
            serde_json::json!(10502),
        );
        assert_eq!(channel.unicast_rtp_local_port(), Some(10502));
    }

    #[test]
    fn dedup_key_requires_a_timestamp() {
        let json = r#"{"type": "StasisEnd", "channel": {"id": "c1"}}"#;
        let event: AriEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.dedup_key(), None);

        let json = r#"{"type": "StasisEnd", "timestamp": "t", "channel": {"id": "c1"}}"#;
        let event: AriEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.dedup_key(), Some("StasisEnd:t:c1".to_string()));
    }
}
