use serde::{Deserialize, Deserializer, Serialize};

use crate::clock::Millis;

/// One controllable local player instance.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub id: String,
}

impl Device {
    pub fn new(title: impl Into<String>, id: impl Into<String>) -> Self {
        Device {
            title: title.into(),
            id: id.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.title.is_empty() && !self.id.is_empty()
    }
}

/// A player command addressed to exactly one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum Command {
    Play {
        device: Device,
        filename: String,
        offset_ms: Millis,
    },
    Pause {
        device: Device,
    },
    Seek {
        device: Device,
        offset_ms: Millis,
    },
    Stop {
        device: Device,
    },
}

impl Command {
    pub fn device(&self) -> &Device {
        match self {
            Command::Play { device, .. }
            | Command::Pause { device }
            | Command::Seek { device, .. }
            | Command::Stop { device } => device,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Play { .. } => "play",
            Command::Pause { .. } => "pause",
            Command::Seek { .. } => "seek",
            Command::Stop { .. } => "stop",
        }
    }
}

/// A command without its addressee, used for fan-out where every
/// participant has chosen a different device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTemplate {
    Play { filename: String, offset_ms: Millis },
    Pause,
    Seek { offset_ms: Millis },
    Stop,
}

impl CommandTemplate {
    pub fn for_device(&self, device: Device) -> Command {
        match self {
            CommandTemplate::Play {
                filename,
                offset_ms,
            } => Command::Play {
                device,
                filename: filename.clone(),
                offset_ms: *offset_ms,
            },
            CommandTemplate::Pause => Command::Pause { device },
            CommandTemplate::Seek { offset_ms } => Command::Seek {
                device,
                offset_ms: *offset_ms,
            },
            CommandTemplate::Stop => Command::Stop { device },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        authorized_clients: Vec<Device>,
    },
    StatusUpdate {
        filename: String,
        #[serde(alias = "current_offset", deserialize_with = "millis")]
        offset_ms: Millis,
    },
    KeepAlive {},
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Accepts integer or fractional milliseconds.
fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "invalid offset {}",
            value
        )));
    }
    Ok(value as Millis)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Command {
        #[serde(flatten)]
        command: Command,
    },
    Registered {
        devices: Vec<Device>,
    },
    RegisterDeclined {
        reason: String,
    },
}

impl From<Command> for ServerMessage {
    fn from(command: Command) -> Self {
        ServerMessage::Command { command }
    }
}
