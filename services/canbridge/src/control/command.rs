//! Control-plane command grammar
//!
//! One command per line. Verbs are case-insensitive; identifiers are
//! `0x`-prefixed hexadecimal or decimal.

use std::fmt;
use std::str::FromStr;

use crate::can::CanId;
use crate::error::{BridgeError, Result};
use crate::lift::LiftDirection;

/// Help text shared by the prompt and the `help` command
pub const HELP_TEXT: &[&str] = &[
    "Available commands:",
    "  LIFT_UP        - Start raising the lift",
    "  LIFT_DOWN      - Start lowering the lift",
    "  STOP           - Stop the lift and resume passthrough",
    "  STATUS_CHECK   - Show CAN interface states",
    "  block <id>     - Block a CAN ID (e.g., block 0x1A0)",
    "  unblock <id>   - Unblock a CAN ID (e.g., unblock 0x1A0)",
    "  list           - List currently blocked IDs",
    "  status         - Show system status",
    "  pause          - Pause the passthrough",
    "  resume         - Resume the passthrough",
    "  help           - Show this list",
    "  quit           - Exit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Lift(LiftDirection),
    Stop,
    StatusCheck,
    Block(CanId),
    Unblock(CanId),
    List,
    Status,
    Pause,
    Resume,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        line.parse().map(Some)
    }
}

impl FromStr for Command {
    type Err = BridgeError;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next();

        let command = match verb.to_ascii_lowercase().as_str() {
            "lift_up" => Command::Lift(LiftDirection::Up),
            "lift_down" => Command::Lift(LiftDirection::Down),
            "stop" => Command::Stop,
            "status_check" => Command::StatusCheck,
            "block" => Command::Block(require_id("block", arg)?),
            "unblock" => Command::Unblock(require_id("unblock", arg)?),
            "list" => Command::List,
            "status" => Command::Status,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => {
                return Err(BridgeError::ProtocolError(format!(
                    "Unknown command: {}",
                    line.trim()
                )))
            },
        };

        if parts.next().is_some() {
            return Err(BridgeError::ProtocolError(format!(
                "Too many arguments: {}",
                line.trim()
            )));
        }
        Ok(command)
    }
}

fn require_id(verb: &str, arg: Option<&str>) -> Result<CanId> {
    match arg {
        Some(text) => CanId::parse(text),
        None => Err(BridgeError::ProtocolError(format!("Usage: {verb} <id>"))),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Lift(LiftDirection::Up) => write!(f, "LIFT_UP"),
            Command::Lift(LiftDirection::Down) => write!(f, "LIFT_DOWN"),
            Command::Stop => write!(f, "STOP"),
            Command::StatusCheck => write!(f, "STATUS_CHECK"),
            Command::Block(id) => write!(f, "block {id}"),
            Command::Unblock(id) => write!(f, "unblock {id}"),
            Command::List => write!(f, "list"),
            Command::Status => write!(f, "status"),
            Command::Pause => write!(f, "pause"),
            Command::Resume => write!(f, "resume"),
            Command::Help => write!(f, "help"),
            Command::Quit => write!(f, "quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u16) -> CanId {
        CanId::new(raw).unwrap()
    }

    #[test]
    fn test_verbs_are_case_insensitive() {
        assert_eq!(
            "LIFT_UP".parse::<Command>().unwrap(),
            Command::Lift(LiftDirection::Up)
        );
        assert_eq!(
            "lift_down".parse::<Command>().unwrap(),
            Command::Lift(LiftDirection::Down)
        );
        assert_eq!("Stop".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("PAUSE".parse::<Command>().unwrap(), Command::Pause);
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn test_block_accepts_hex_and_decimal() {
        assert_eq!(
            "block 0x123".parse::<Command>().unwrap(),
            Command::Block(id(0x123))
        );
        assert_eq!(
            "  unblock   291 ".parse::<Command>().unwrap(),
            Command::Unblock(id(0x123))
        );
    }

    #[test]
    fn test_block_errors() {
        let missing = "block".parse::<Command>().unwrap_err();
        assert!(matches!(missing, BridgeError::ProtocolError(_)));
        assert_eq!(missing.to_string(), "Usage: block <id>");

        let bad = "block 0xZZZ".parse::<Command>().unwrap_err();
        assert!(matches!(bad, BridgeError::InvalidIdentifier(_)));

        let too_big = "block 0x800".parse::<Command>().unwrap_err();
        assert!(matches!(too_big, BridgeError::InvalidIdentifier(_)));

        assert!("block 0x1 0x2".parse::<Command>().is_err());
    }

    #[test]
    fn test_unknown_command() {
        let err = "jump".parse::<Command>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: jump");
    }

    #[test]
    fn test_blank_line_is_ignored() {
        assert_eq!(Command::parse_line("   ").unwrap(), None);
        assert_eq!(Command::parse_line("list").unwrap(), Some(Command::List));
    }

    #[test]
    fn test_display_parses_back() {
        for command in [
            Command::Lift(LiftDirection::Up),
            Command::StatusCheck,
            Command::Block(id(0x7FF)),
            Command::Unblock(id(0x1)),
            Command::Quit,
        ] {
            assert_eq!(command.to_string().parse::<Command>().unwrap(), command);
        }
    }
}
