use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::TradeSide;

/// Terminal lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminalStatus {
    /// Requested by enable-auto-sync, not yet handed to the orchestrator
    Pending,
    /// Desired state served to the orchestrator, waiting for the first heartbeat
    Starting,
    /// Heartbeats are arriving
    Running,
    /// Disable requested, waiting for the orchestrator poll
    Stopping,
    Stopped,
    /// Unrecoverable deploy/connect failure, sticky until the user retries
    Error,
}

/// States that count toward the one-live-instance-per-account invariant
pub const LIVE_STATUSES: [TerminalStatus; 4] = [
    TerminalStatus::Pending,
    TerminalStatus::Starting,
    TerminalStatus::Running,
    TerminalStatus::Stopping,
];

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Pending => "PENDING",
            TerminalStatus::Starting => "STARTING",
            TerminalStatus::Running => "RUNNING",
            TerminalStatus::Stopping => "STOPPING",
            TerminalStatus::Stopped => "STOPPED",
            TerminalStatus::Error => "ERROR",
        }
    }

    pub fn is_live(&self) -> bool {
        LIVE_STATUSES.contains(self)
    }

    /// Whether a heartbeat may promote this state to RUNNING.
    ///
    /// STOPPING and STOPPED belong to the orchestrator, ERROR to the user.
    pub fn accepts_heartbeat_promotion(&self) -> bool {
        matches!(
            self,
            TerminalStatus::Pending | TerminalStatus::Starting | TerminalStatus::Running
        )
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TerminalStatus) -> bool {
        use TerminalStatus::*;

        match (self, target) {
            // Orchestrator picked up the desired state
            (Pending, Starting) => true,

            // Heartbeat evidence of liveness
            (Pending, Running) | (Starting, Running) | (Running, Running) => true,

            // Disable auto-sync
            (Pending, Stopping) | (Starting, Stopping) | (Running, Stopping) => true,
            (Error, Stopping) => true,

            // Orchestrator poll resolves the stop
            (Stopping, Stopped) => true,

            // Deploy/connect failure
            (Pending, Error) | (Starting, Error) | (Running, Error) => true,

            // User retry
            (Stopped, Pending) | (Error, Pending) => true,

            _ => false,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TerminalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TerminalStatus::Pending),
            "STARTING" => Ok(TerminalStatus::Starting),
            "RUNNING" => Ok(TerminalStatus::Running),
            "STOPPING" => Ok(TerminalStatus::Stopping),
            "STOPPED" => Ok(TerminalStatus::Stopped),
            "ERROR" => Ok(TerminalStatus::Error),
            other => Err(format!("unknown terminal status: {}", other)),
        }
    }
}

/// One remote trading terminal bound to a broker account
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInstance {
    pub id: Uuid,
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub status: TerminalStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: TerminalMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TerminalInstance {
    pub fn new_pending(account_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            user_id,
            status: TerminalStatus::Pending,
            last_heartbeat: None,
            last_sync_at: None,
            error_message: None,
            metadata: TerminalMetadata::Empty,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Open position as reported by the terminal's position sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    pub ticket: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub profit: Decimal,
    pub open_time: DateTime<Utc>,
}

/// Free-form terminal metadata, typed over the shapes this service writes.
///
/// Anything else found in storage is preserved as `Opaque`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TerminalMetadata {
    #[default]
    Empty,
    OpenPositions {
        positions: Vec<OpenPosition>,
        updated_at: DateTime<Utc>,
    },
    ErrorDetail {
        message: String,
        at: DateTime<Utc>,
    },
    Opaque(Value),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct OpenPositionsShape {
    open_positions: Vec<OpenPosition>,
    positions_updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ErrorDetailShape {
    error_detail: ErrorDetailBody,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorDetailBody {
    message: String,
    at: DateTime<Utc>,
}

impl TerminalMetadata {
    pub fn from_value(value: Value) -> Self {
        match &value {
            Value::Null => return TerminalMetadata::Empty,
            Value::Object(map) if map.is_empty() => return TerminalMetadata::Empty,
            _ => {}
        }

        if let Ok(shape) = serde_json::from_value::<OpenPositionsShape>(value.clone()) {
            return TerminalMetadata::OpenPositions {
                positions: shape.open_positions,
                updated_at: shape.positions_updated_at,
            };
        }

        if let Ok(shape) = serde_json::from_value::<ErrorDetailShape>(value.clone()) {
            return TerminalMetadata::ErrorDetail {
                message: shape.error_detail.message,
                at: shape.error_detail.at,
            };
        }

        TerminalMetadata::Opaque(value)
    }

    pub fn to_value(&self) -> Value {
        let shaped = match self {
            TerminalMetadata::Empty => return Value::Object(Default::default()),
            TerminalMetadata::Opaque(value) => return value.clone(),
            TerminalMetadata::OpenPositions {
                positions,
                updated_at,
            } => serde_json::to_value(OpenPositionsShape {
                open_positions: positions.clone(),
                positions_updated_at: *updated_at,
            }),
            TerminalMetadata::ErrorDetail { message, at } => serde_json::to_value(ErrorDetailShape {
                error_detail: ErrorDetailBody {
                    message: message.clone(),
                    at: *at,
                },
            }),
        };
        shaped.unwrap_or(Value::Null)
    }

    pub fn open_positions(&self) -> Option<&[OpenPosition]> {
        match self {
            TerminalMetadata::OpenPositions { positions, .. } => Some(positions),
            _ => None,
        }
    }
}

impl Serialize for TerminalMetadata {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Command tag understood by the terminal agent
pub const FETCH_CANDLES: &str = "FETCH_CANDLES";

/// Command queue states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Dispatched => "DISPATCHED",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
        }
    }
}

impl TryFrom<&str> for CommandStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(CommandStatus::Pending),
            "DISPATCHED" => Ok(CommandStatus::Dispatched),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            other => Err(format!("unknown command status: {}", other)),
        }
    }
}

/// One-shot instruction queued for a terminal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCommand {
    pub id: Uuid,
    pub terminal_id: Uuid,
    pub command: String,
    pub payload: Option<String>,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TerminalCommand {
    pub fn new_pending(
        terminal_id: Uuid,
        command: impl Into<String>,
        payload: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            terminal_id,
            command: command.into(),
            payload,
            status: CommandStatus::Pending,
            created_at: now,
            dispatched_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_live_statuses() {
        assert!(TerminalStatus::Pending.is_live());
        assert!(TerminalStatus::Stopping.is_live());
        assert!(!TerminalStatus::Stopped.is_live());
        assert!(!TerminalStatus::Error.is_live());
    }

    #[test]
    fn test_transitions() {
        assert!(TerminalStatus::Stopping.can_transition_to(TerminalStatus::Stopped));
        assert!(TerminalStatus::Error.can_transition_to(TerminalStatus::Pending));
        assert!(!TerminalStatus::Stopped.can_transition_to(TerminalStatus::Running));
        assert!(!TerminalStatus::Running.can_transition_to(TerminalStatus::Stopped));
    }

    #[test]
    fn test_metadata_open_positions_round_trip() {
        let now = Utc::now();
        let metadata = TerminalMetadata::OpenPositions {
            positions: vec![OpenPosition {
                ticket: "1001".into(),
                symbol: "EURUSD".into(),
                side: TradeSide::Buy,
                volume: dec!(0.1),
                open_price: dec!(1.1),
                current_price: dec!(1.2),
                profit: dec!(10),
                open_time: now,
            }],
            updated_at: now,
        };
        let value = metadata.to_value();
        assert!(value.get("openPositions").is_some());
        assert_eq!(TerminalMetadata::from_value(value), metadata);
    }

    #[test]
    fn test_metadata_unknown_shape_is_opaque() {
        let value = json!({"containerHost": "vm-3", "port": 4010});
        assert_eq!(
            TerminalMetadata::from_value(value.clone()),
            TerminalMetadata::Opaque(value)
        );
        assert_eq!(TerminalMetadata::from_value(json!({})), TerminalMetadata::Empty);
    }
}
