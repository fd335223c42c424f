//! JSON control messages exchanged with the agent runtime over the session socket.
//!
//! Every message is a JSON object carrying a `type` discriminator. Audio travels
//! in both directions as base64 text inside `websocket_audio` messages.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Agent behaviour settings embedded in the `START` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub llm_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_preamble: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filler_type: Option<String>,
    #[serde(rename = "bgNoise", default, skip_serializing_if = "Option::is_none")]
    pub bg_noise: Option<bool>,
}

/// Immutable input to a session, sent once as the `START` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub agent_config: AgentConfig,
    pub stt_type: String,
    pub stt_language_id: String,
    pub tts_type: String,
    pub tts_voice: String,
}

/// Audio format announced by the server in `AUDIO_CONFIG_START`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub format: String,
    pub sample_rate: u32,
}

/// Audio encodings the client can decode for playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum AudioEncoding {
    #[strum(to_string = "mulaw", serialize = "mu-law", serialize = "pcm_mulaw")]
    Mulaw,
    #[strum(to_string = "linear16", serialize = "pcm_s16le")]
    Linear16,
}

/// Encoding plus sample rate of a stream of audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// 8 kHz mu-law, the telephony format the backend streams by default.
    pub const NARROWBAND_MULAW: AudioFormat = AudioFormat {
        encoding: AudioEncoding::Mulaw,
        sample_rate: 8000,
    };

    /// Resolve a server-announced format, falling back to narrow-band mu-law
    /// when the encoding is not one we can decode.
    pub fn from_announced(config: &AudioConfig) -> Self {
        match config.format.parse::<AudioEncoding>() {
            Ok(encoding) if config.sample_rate > 0 => AudioFormat {
                encoding,
                sample_rate: config.sample_rate,
            },
            _ => {
                log::warn!(
                    "Protocol: unsupported output audio format {} @ {}Hz, assuming 8kHz mu-law",
                    config.format,
                    config.sample_rate
                );
                Self::NARROWBAND_MULAW
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Human,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub sender: Speaker,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    #[serde(rename = "websocket_start")]
    Start(SessionConfiguration),
    #[serde(rename = "websocket_ready")]
    Ready,
    #[serde(rename = "websocket_audio")]
    Audio { data: String },
    #[serde(rename = "websocket_audio_config_start")]
    AudioConfigStart {
        input_audio_config: AudioConfig,
        output_audio_config: AudioConfig,
    },
    #[serde(rename = "websocket_transcript")]
    Transcript(Transcript),
    #[serde(rename = "websocket_stop")]
    Stop,
    #[serde(rename = "websocket_error")]
    Error { error: String },
}

/// Outcome of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ProtocolMessage),
    /// Well-formed JSON with a `type` we do not handle.
    Unknown(String),
    Malformed(String),
}

impl ProtocolMessage {
    pub fn to_json(&self) -> String {
        // Serialising these plain data types cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Inbound {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Inbound::Malformed(e.to_string()),
        };
        let kind = match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => kind.to_string(),
            None => return Inbound::Malformed("missing 'type' field".to_string()),
        };
        match serde_json::from_value::<ProtocolMessage>(value) {
            Ok(message) => Inbound::Message(message),
            Err(_) if !Self::is_known_type(&kind) => Inbound::Unknown(kind),
            Err(e) => Inbound::Malformed(format!("{}: {}", kind, e)),
        }
    }

    fn is_known_type(kind: &str) -> bool {
        matches!(
            kind,
            "websocket_start"
                | "websocket_ready"
                | "websocket_audio"
                | "websocket_audio_config_start"
                | "websocket_transcript"
                | "websocket_stop"
                | "websocket_error"
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Start(_) => "START",
            ProtocolMessage::Ready => "READY",
            ProtocolMessage::Audio { .. } => "AUDIO",
            ProtocolMessage::AudioConfigStart { .. } => "AUDIO_CONFIG_START",
            ProtocolMessage::Transcript(_) => "TRANSCRIPT",
            ProtocolMessage::Stop => "STOP",
            ProtocolMessage::Error { .. } => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hindi_config() -> SessionConfiguration {
        SessionConfiguration {
            agent_config: AgentConfig {
                llm_type: "CHATGPT".into(),
                initial_message: Some("Hello".into()),
                prompt_preamble: Some("You are a Hindi Agent".into()),
                filler_type: Some("NONE".into()),
                bg_noise: Some(false),
            },
            stt_type: "AZURE".into(),
            stt_language_id: "hi-IN".into(),
            tts_type: "AZURE".into(),
            tts_voice: "hi-IN-AaravNeural".into(),
        }
    }

    #[test]
    fn test_start_wire_shape() {
        let value: serde_json::Value =
            serde_json::from_str(&ProtocolMessage::Start(hindi_config()).to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "websocket_start",
                "agent_config": {
                    "llm_type": "CHATGPT",
                    "initial_message": "Hello",
                    "prompt_preamble": "You are a Hindi Agent",
                    "filler_type": "NONE",
                    "bgNoise": false
                },
                "stt_type": "AZURE",
                "stt_language_id": "hi-IN",
                "tts_type": "AZURE",
                "tts_voice": "hi-IN-AaravNeural"
            })
        );
    }

    #[test]
    fn test_optional_agent_fields_are_omitted() {
        let mut config = hindi_config();
        config.agent_config.initial_message = None;
        config.agent_config.bg_noise = None;
        let json = ProtocolMessage::Start(config).to_json();
        assert!(!json.contains("initial_message"));
        assert!(!json.contains("bgNoise"));
    }

    #[test]
    fn test_control_messages_carry_only_type() {
        assert_eq!(ProtocolMessage::Stop.to_json(), r#"{"type":"websocket_stop"}"#);
        assert_eq!(
            ProtocolMessage::Ready.to_json(),
            r#"{"type":"websocket_ready"}"#
        );
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(
            ProtocolMessage::parse(r#"{"type":"websocket_ready"}"#),
            Inbound::Message(ProtocolMessage::Ready)
        );
        assert_eq!(
            ProtocolMessage::parse(r#"{"type":"websocket_audio","data":"AAA"}"#),
            Inbound::Message(ProtocolMessage::Audio { data: "AAA".into() })
        );
        assert_eq!(
            ProtocolMessage::parse(r#"{"type":"websocket_error","error":"agent not found"}"#),
            Inbound::Message(ProtocolMessage::Error {
                error: "agent not found".into()
            })
        );

        let config = ProtocolMessage::parse(
            r#"{"type":"websocket_audio_config_start",
                "input_audio_config":{"format":"linear16","sample_rate":8000},
                "output_audio_config":{"format":"mulaw","sample_rate":8000}}"#,
        );
        match config {
            Inbound::Message(ProtocolMessage::AudioConfigStart {
                output_audio_config,
                ..
            }) => assert_eq!(
                AudioFormat::from_announced(&output_audio_config),
                AudioFormat::NARROWBAND_MULAW
            ),
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_transcript() {
        let parsed = ProtocolMessage::parse(
            r#"{"type":"websocket_transcript","text":"namaste","sender":"agent","timestamp":1712345678.5}"#,
        );
        assert_eq!(
            parsed,
            Inbound::Message(ProtocolMessage::Transcript(Transcript {
                text: "namaste".into(),
                sender: Speaker::Agent,
                timestamp: 1712345678.5,
            }))
        );
    }

    #[test]
    fn test_parse_unknown_and_malformed() {
        assert_eq!(
            ProtocolMessage::parse(r#"{"type":"websocket_keepalive"}"#),
            Inbound::Unknown("websocket_keepalive".into())
        );
        assert!(matches!(
            ProtocolMessage::parse("not json"),
            Inbound::Malformed(_)
        ));
        assert!(matches!(
            ProtocolMessage::parse(r#"{"data":"AAA"}"#),
            Inbound::Malformed(_)
        ));
        // Known type, missing payload field.
        assert!(matches!(
            ProtocolMessage::parse(r#"{"type":"websocket_audio"}"#),
            Inbound::Malformed(_)
        ));
    }

    #[test]
    fn test_announced_format_fallback() {
        let linear = AudioConfig {
            format: "linear16".into(),
            sample_rate: 16000,
        };
        assert_eq!(
            AudioFormat::from_announced(&linear),
            AudioFormat {
                encoding: AudioEncoding::Linear16,
                sample_rate: 16000
            }
        );

        let opus = AudioConfig {
            format: "opus".into(),
            sample_rate: 48000,
        };
        assert_eq!(
            AudioFormat::from_announced(&opus),
            AudioFormat::NARROWBAND_MULAW
        );
    }
}
