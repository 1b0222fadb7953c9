//! Protocol message definitions
//!
//! Defines the logical message carried inside every frame and the command
//! vocabulary understood by the vehicle.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Structured key/value payload of a message.
///
/// `serde_json::Map` keeps keys sorted, so serializing the same payload
/// always yields the same bytes and the same checksum.
pub type Payload = Map<String, Value>;

/// Payload key carrying the acknowledged id inside an ACK
pub const ACK_ID_KEY: &str = "ack_id";

/// Lowest PWM value accepted by the thrusters
pub const PWM_MIN: u16 = 1000;

/// Highest PWM value accepted by the thrusters
pub const PWM_MAX: u16 = 2000;

/// PWM value at which a thruster produces no thrust
pub const PWM_NEUTRAL: u16 = 1500;

/// Command tag of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    /// Thruster PWM values
    MotorCommand,
    /// Ask the vehicle for a telemetry sample
    TelemetryRequest,
    /// Stop every thruster immediately
    EmergencyStop,
    /// Liveness probe
    Ping,
    /// Receipt of an earlier message
    Ack,
    /// Telemetry sample from the vehicle
    Telemetry,
    /// Any tag this station does not know about, carried verbatim
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::MotorCommand => "MOTOR_COMMAND",
            Command::TelemetryRequest => "TELEMETRY_REQUEST",
            Command::EmergencyStop => "EMERGENCY_STOP",
            Command::Ping => "PING",
            Command::Ack => "ACK",
            Command::Telemetry => "TELEMETRY",
            Command::Other(tag) => tag,
        }
    }
}

impl From<&str> for Command {
    fn from(tag: &str) -> Self {
        match tag {
            "MOTOR_COMMAND" => Command::MotorCommand,
            "TELEMETRY_REQUEST" => Command::TelemetryRequest,
            "EMERGENCY_STOP" => Command::EmergencyStop,
            "PING" => Command::Ping,
            "ACK" => Command::Ack,
            "TELEMETRY" => Command::Telemetry,
            other => Command::Other(other.to_string()),
        }
    }
}

impl From<String> for Command {
    fn from(tag: String) -> Self {
        match Command::from(tag.as_str()) {
            Command::Other(_) => Command::Other(tag),
            known => known,
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        match command {
            Command::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical message, the unit carried by a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence id, 1..=65535
    pub id: u16,
    /// Command tag
    pub command: Command,
    /// Command arguments
    #[serde(default)]
    pub data: Payload,
    /// Seconds since the Unix epoch at creation
    pub timestamp: f64,
    /// Whether the receiver must answer with an ACK
    #[serde(default)]
    pub require_ack: bool,
}

impl Message {
    pub fn new(id: u16, command: Command, data: Payload, require_ack: bool) -> Self {
        Self {
            id,
            command,
            data,
            timestamp: unix_time_secs(),
            require_ack,
        }
    }

    /// Build the ACK answering `original_id`
    pub fn ack(id: u16, original_id: u16) -> Self {
        let mut data = Payload::new();
        data.insert(ACK_ID_KEY.to_string(), Value::from(original_id));
        Self::new(id, Command::Ack, data, false)
    }

    pub fn is_ack(&self) -> bool {
        self.command == Command::Ack
    }

    /// The id an ACK refers to, if this is a well-formed ACK
    pub fn acked_id(&self) -> Option<u16> {
        if !self.is_ack() {
            return None;
        }
        self.data
            .get(ACK_ID_KEY)
            .and_then(Value::as_u64)
            .and_then(|id| u16::try_from(id).ok())
    }
}

/// PWM values for the six thrusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSet {
    pub front_left: u16,
    pub front_right: u16,
    pub back_left: u16,
    pub back_right: u16,
    pub vertical_1: u16,
    pub vertical_2: u16,
}

impl Default for MotorSet {
    fn default() -> Self {
        Self::neutral()
    }
}

impl MotorSet {
    /// All thrusters at rest
    pub fn neutral() -> Self {
        Self {
            front_left: PWM_NEUTRAL,
            front_right: PWM_NEUTRAL,
            back_left: PWM_NEUTRAL,
            back_right: PWM_NEUTRAL,
            vertical_1: PWM_NEUTRAL,
            vertical_2: PWM_NEUTRAL,
        }
    }

    /// Copy with every value forced into `PWM_MIN..=PWM_MAX`
    pub fn clamped(self) -> Self {
        let clamp = |v: u16| v.clamp(PWM_MIN, PWM_MAX);
        Self {
            front_left: clamp(self.front_left),
            front_right: clamp(self.front_right),
            back_left: clamp(self.back_left),
            back_right: clamp(self.back_right),
            vertical_1: clamp(self.vertical_1),
            vertical_2: clamp(self.vertical_2),
        }
    }

    /// Values in wire order: front left, front right, back left, back right,
    /// vertical 1, vertical 2
    pub fn as_array(&self) -> [u16; 6] {
        [
            self.front_left,
            self.front_right,
            self.back_left,
            self.back_right,
            self.vertical_1,
            self.vertical_2,
        ]
    }

    /// Payload of a `MOTOR_COMMAND` message: `{"motors": {...}}`
    pub fn to_payload(&self) -> Payload {
        let m = self.clamped();
        let mut data = Payload::new();
        data.insert(
            "motors".to_string(),
            json!({
                "front_left": m.front_left,
                "front_right": m.front_right,
                "back_left": m.back_left,
                "back_right": m.back_right,
                "vertical_1": m.vertical_1,
                "vertical_2": m.vertical_2,
            }),
        );
        data
    }
}

/// Current wall-clock time as fractional Unix seconds
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags_roundtrip() {
        for tag in ["MOTOR_COMMAND", "PING", "ACK", "LIGHTS_ON"] {
            let command = Command::from(tag);
            assert_eq!(command.as_str(), tag);
            assert_eq!(String::from(command), tag);
        }
        assert_eq!(Command::from("LIGHTS_ON"), Command::Other("LIGHTS_ON".into()));
    }

    #[test]
    fn test_command_serializes_as_plain_string() {
        let json = serde_json::to_string(&Command::EmergencyStop).unwrap();
        assert_eq!(json, "\"EMERGENCY_STOP\"");
        let parsed: Command = serde_json::from_str("\"CAMERA_TILT\"").unwrap();
        assert_eq!(parsed, Command::Other("CAMERA_TILT".into()));
    }

    #[test]
    fn test_ack_refers_to_original() {
        let ack = Message::ack(9, 42);
        assert!(ack.is_ack());
        assert!(!ack.require_ack);
        assert_eq!(ack.acked_id(), Some(42));
    }

    #[test]
    fn test_acked_id_rejects_out_of_range() {
        let mut ack = Message::ack(1, 1);
        ack.data.insert(ACK_ID_KEY.into(), Value::from(70_000));
        assert_eq!(ack.acked_id(), None);

        let ping = Message::new(2, Command::Ping, Payload::new(), false);
        assert_eq!(ping.acked_id(), None);
    }

    #[test]
    fn test_motor_set_clamps() {
        let motors = MotorSet {
            front_left: 900,
            vertical_2: 2400,
            ..MotorSet::neutral()
        };
        let clamped = motors.clamped();
        assert_eq!(clamped.front_left, PWM_MIN);
        assert_eq!(clamped.vertical_2, PWM_MAX);
        assert_eq!(clamped.back_left, PWM_NEUTRAL);
    }

    #[test]
    fn test_motor_payload_missing_fields_are_neutral() {
        let motors: MotorSet = serde_json::from_str(r#"{"front_left": 1600}"#).unwrap();
        assert_eq!(motors.as_array(), [1600, 1500, 1500, 1500, 1500, 1500]);

        let payload = motors.to_payload();
        assert_eq!(payload["motors"]["front_left"], 1600);
    }

    #[test]
    fn test_motor_payload_is_clamped() {
        let motors = MotorSet {
            back_right: 2600,
            vertical_1: 0,
            ..MotorSet::neutral()
        };
        let payload = motors.to_payload();
        let decoded: MotorSet = serde_json::from_value(payload["motors"].clone()).unwrap();
        assert_eq!(decoded.as_array(), [1500, 1500, 1500, 2000, 1000, 1500]);
        assert_eq!(payload["motors"].as_object().unwrap().len(), 6);
    }
}
