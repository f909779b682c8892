//! Control-plane commands.
//!
//! Commands arrive over the admin endpoint (or a script in backtest mode),
//! are parsed here, and are serialised onto the core loop through the
//! priority queue — so every command observes, and is observed by, a
//! consistent state.

use serde::Serialize;

// ─────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    Flatten,
    Reload,
    Set(Vec<(String, String)>),
    Markets { enable: bool, ids: Vec<String> },
    Backtest,
    Stop,
}

/// Parse one command line, e.g. `set min_edge_threshold=0.01 target_size=50`
/// or `markets off m1 m2`.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let head = parts.next().ok_or_else(|| "empty command".to_string())?;
    match head.to_ascii_lowercase().as_str() {
        "pause" => Ok(Command::Pause),
        "resume" => Ok(Command::Resume),
        "flatten" => Ok(Command::Flatten),
        "reload" => Ok(Command::Reload),
        "backtest" => Ok(Command::Backtest),
        "stop" => Ok(Command::Stop),
        "set" => {
            let mut pairs = Vec::new();
            for kv in parts {
                let (k, v) = kv
                    .split_once('=')
                    .ok_or_else(|| format!("set: expected k=v, got {kv:?}"))?;
                if k.is_empty() || v.is_empty() {
                    return Err(format!("set: malformed pair {kv:?}"));
                }
                pairs.push((k.to_string(), v.to_string()));
            }
            if pairs.is_empty() {
                return Err("set: no pairs given".into());
            }
            Ok(Command::Set(pairs))
        }
        "markets" => {
            let action = parts
                .next()
                .ok_or_else(|| "markets: expected on|off".to_string())?;
            let enable = match action.to_ascii_lowercase().as_str() {
                "on" => true,
                "off" => false,
                other => return Err(format!("markets: expected on|off, got {other:?}")),
            };
            let ids: Vec<String> = parts.map(str::to_string).collect();
            if ids.is_empty() {
                return Err("markets: no market ids given".into());
            }
            Ok(Command::Markets { enable, ids })
        }
        other => Err(format!("unknown command {other:?}")),
    }
}

// ─────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Ok,
    Refused,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            status: CommandStatus::Ok,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Refused,
            reason: Some(reason.into()),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Error,
            reason: Some(reason.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
