//! The JSON messages exchanged with the update server.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::config::AppInfo;

/// A command sent by the server, selected by its `cmd` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum Command {
    Connect {
        #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    Disconnect {
        #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    Apdu {
        #[serde(default, deserialize_with = "text")]
        bytes: String,
    },
    Message {
        #[serde(default, deserialize_with = "text")]
        text: String,
    },
    Dialog {
        #[serde(default, deserialize_with = "text")]
        text: String,
    },
    Verify {
        #[serde(default, deserialize_with = "text")]
        text: String,
        #[serde(default = "default_reference", deserialize_with = "reference")]
        p2: u8,
    },
    Decrypt {
        #[serde(default, deserialize_with = "text")]
        bytes: String,
        #[serde(default, deserialize_with = "text")]
        text: String,
    },
    Stop {
        #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

// Fields of the wrong type take their default instead of rejecting the command.

fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(optional_text(deserializer)?.unwrap_or_default())
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        _ => None,
    })
}

fn default_reference() -> u8 {
    1
}

fn reference<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let reference = match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    };

    Ok(reference
        .and_then(|r| u8::try_from(r).ok())
        .unwrap_or_else(default_reference))
}

/// One decoded server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub session: Option<String>,
    pub command: Command,
}

impl Inbound {
    /// Decodes a server message. Anything that is not a well formed known command, including
    /// malformed JSON, decodes as [`Command::Unknown`].
    pub fn decode(data: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(data) else {
            return Self {
                session: None,
                command: Command::Unknown,
            };
        };

        let session = value
            .get("session")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            session,
            command: Command::deserialize(value).unwrap_or(Command::Unknown),
        }
    }
}

/// The session token assigned by the server. Set from the first message carrying a non-empty
/// token and never changed afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session(Option<String>);

impl Session {
    pub fn observe(&mut self, token: Option<&str>) {
        if self.0.is_none() {
            self.0 = token.filter(|t| !t.is_empty()).map(str::to_string);
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// A message sent to the server: a flat object of scalar fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    fields: Map<String, Value>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// A response with the `<name>: OK|NOK` result field set.
    pub fn result(name: &str, ok: bool) -> Self {
        Self::new().with(name, if ok { "OK" } else { "NOK" })
    }

    /// The `START` message opening the protocol.
    pub fn start(language: &str, app: &AppInfo) -> Self {
        Self::new()
            .with("cmd", "START")
            .with("lang", language)
            .with("platform", app.os.as_str())
            .with("version", app.version.as_str())
    }

    /// The answer to commands this client does not know.
    pub fn unknown() -> Self {
        Self::new().with("CMD", "UNKNOWN")
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Compact JSON of the message, carrying the session once it is known.
    pub fn encode(&self, session: &Session) -> String {
        let mut fields = Map::new();
        if let Some(token) = session.token() {
            fields.insert("session".to_string(), Value::from(token));
        }

        fields.extend(self.fields.clone());
        Value::Object(fields).to_string()
    }
}
