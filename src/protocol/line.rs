//! Line-oriented ASCII protocol
//!
//! Simple serial controllers take one command per line instead of framed
//! messages, e.g. `MOTOR,1500,1500,1500,1500,1600,1600`.

use std::fmt;

use super::MotorSet;

/// A command of the line protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCommand {
    /// `MOTOR,fl,fr,bl,br,v1,v2`
    Motor(MotorSet),
    /// `GET_TELEMETRY`
    GetTelemetry,
    /// `EMERGENCY_STOP`
    EmergencyStop,
    /// `PING`
    Ping,
    /// Anything else, sent verbatim
    Custom(String),
}

impl LineCommand {
    /// The line as sent, including the terminating `\n`
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for LineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineCommand::Motor(motors) => {
                f.write_str("MOTOR")?;
                for value in motors.clamped().as_array() {
                    write!(f, ",{}", value)?;
                }
                Ok(())
            }
            LineCommand::GetTelemetry => f.write_str("GET_TELEMETRY"),
            LineCommand::EmergencyStop => f.write_str("EMERGENCY_STOP"),
            LineCommand::Ping => f.write_str("PING"),
            LineCommand::Custom(text) => f.write_str(text.trim_end_matches(['\r', '\n'])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_line() {
        let motors = MotorSet {
            vertical_1: 1600,
            vertical_2: 1600,
            ..MotorSet::neutral()
        };
        assert_eq!(
            LineCommand::Motor(motors).to_line(),
            "MOTOR,1500,1500,1500,1500,1600,1600\n"
        );
    }

    #[test]
    fn test_simple_lines() {
        assert_eq!(LineCommand::GetTelemetry.to_line(), "GET_TELEMETRY\n");
        assert_eq!(LineCommand::EmergencyStop.to_line(), "EMERGENCY_STOP\n");
        assert_eq!(LineCommand::Ping.to_line(), "PING\n");
    }

    #[test]
    fn test_custom_line_is_terminated_once() {
        assert_eq!(LineCommand::Custom("LIGHTS,ON\n".into()).to_line(), "LIGHTS,ON\n");
    }
}
