//! Adapter commands: write a code, then poll the result register.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::GatewayCore;
use crate::registers::CommandRegisters;

/// Command codes accepted by the command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    RebootAdapter = 2,
    ResetErrors = 3,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::RebootAdapter => write!(f, "reboot adapter"),
            Command::ResetErrors => write!(f, "reset boiler errors"),
        }
    }
}

/// How long to wait for a command to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    /// Pause between writing the command and the first result poll.
    pub settle_delay: Duration,
    /// Pause between result polls.
    pub poll_interval: Duration,
    /// Result polls before giving up.
    pub max_attempts: u32,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// Terminal failure codes reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRejection {
    AdapterTimeout,
    NotSupportedByAdapter,
    NotSupportedByBoiler,
    ExecutionError,
}

impl std::fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandRejection::AdapterTimeout => write!(f, "adapter timed out"),
            CommandRejection::NotSupportedByAdapter => write!(f, "not supported by adapter"),
            CommandRejection::NotSupportedByBoiler => write!(f, "not supported by boiler"),
            CommandRejection::ExecutionError => write!(f, "execution error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("failed to write command '{0}'")]
    WriteFailed(Command),

    #[error("command rejected: {0}")]
    Rejected(CommandRejection),

    #[error("no result after {attempts} polls (last code: {last_code:?})")]
    Timeout {
        attempts: u32,
        last_code: Option<i16>,
    },

    #[error("unknown command result code {0}")]
    UnknownCode(i16),
}

/// Decoded value of the result register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    /// No command issued yet.
    Idle,
    Processing,
    Rejected(CommandRejection),
    Unknown(i16),
}

impl ResultCode {
    pub fn from_raw(raw: u16) -> Self {
        match raw as i16 {
            0 => ResultCode::Success,
            1 => ResultCode::Idle,
            2 => ResultCode::Processing,
            -1 => ResultCode::Rejected(CommandRejection::AdapterTimeout),
            -2 => ResultCode::Rejected(CommandRejection::NotSupportedByAdapter),
            -3 => ResultCode::Rejected(CommandRejection::NotSupportedByBoiler),
            -5 => ResultCode::Rejected(CommandRejection::ExecutionError),
            other => ResultCode::Unknown(other),
        }
    }

    /// Whether the adapter may still report a final result.
    pub fn is_pending(self) -> bool {
        matches!(self, ResultCode::Idle | ResultCode::Processing)
    }
}

/// Issue `command` and wait for a terminal result.
pub(crate) async fn execute(
    core: &GatewayCore,
    registers: CommandRegisters,
    command: Command,
    policy: &CommandPolicy,
) -> Result<(), CommandError> {
    info!(slave = core.slave_id(), "Sending command: {}", command);

    if !core.write(registers.command, command.code()).await {
        return Err(CommandError::WriteFailed(command));
    }

    tokio::time::sleep(policy.settle_delay).await;

    let mut last_code = None;
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.poll_interval).await;
        }

        let Some(raw) = core
            .read_holding(registers.result, 1)
            .await
            .and_then(|words| words.first().copied())
        else {
            debug!(slave = core.slave_id(), attempt, "Command result read failed");
            continue;
        };

        let code = ResultCode::from_raw(raw);
        last_code = Some(raw as i16);
        debug!(slave = core.slave_id(), attempt, "Command result: {:?}", code);

        match code {
            ResultCode::Success => {
                info!(slave = core.slave_id(), "Command '{}' completed", command);
                return Ok(());
            }
            ResultCode::Rejected(reason) => {
                warn!(slave = core.slave_id(), "Command '{}' rejected: {}", command, reason);
                return Err(CommandError::Rejected(reason));
            }
            ResultCode::Unknown(code) => {
                warn!(slave = core.slave_id(), code, "Command '{}' returned unknown code", command);
                return Err(CommandError::UnknownCode(code));
            }
            ResultCode::Idle | ResultCode::Processing => {}
        }
    }

    warn!(
        slave = core.slave_id(),
        attempts = policy.max_attempts,
        ?last_code,
        "Command '{}' did not complete",
        command
    );
    Err(CommandError::Timeout {
        attempts: policy.max_attempts,
        last_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(ResultCode::from_raw(0), ResultCode::Success);
        assert_eq!(ResultCode::from_raw(1), ResultCode::Idle);
        assert_eq!(ResultCode::from_raw(2), ResultCode::Processing);
        assert_eq!(
            ResultCode::from_raw(0xFFFF),
            ResultCode::Rejected(CommandRejection::AdapterTimeout)
        );
        assert_eq!(
            ResultCode::from_raw(0xFFFE),
            ResultCode::Rejected(CommandRejection::NotSupportedByAdapter)
        );
        assert_eq!(
            ResultCode::from_raw(0xFFFD),
            ResultCode::Rejected(CommandRejection::NotSupportedByBoiler)
        );
        assert_eq!(
            ResultCode::from_raw(0xFFFB),
            ResultCode::Rejected(CommandRejection::ExecutionError)
        );
        assert_eq!(ResultCode::from_raw(0xFFFC), ResultCode::Unknown(-4));
        assert_eq!(ResultCode::from_raw(7), ResultCode::Unknown(7));
    }

    #[test]
    fn test_pending_codes() {
        assert!(ResultCode::Idle.is_pending());
        assert!(ResultCode::Processing.is_pending());
        assert!(!ResultCode::Success.is_pending());
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::RebootAdapter.code(), 2);
        assert_eq!(Command::ResetErrors.code(), 3);
    }

    #[test]
    fn test_error_display() {
        let err = CommandError::Timeout {
            attempts: 5,
            last_code: Some(2),
        };
        assert_eq!(err.to_string(), "no result after 5 polls (last code: Some(2))");

        let err = CommandError::Rejected(CommandRejection::NotSupportedByBoiler);
        assert_eq!(err.to_string(), "command rejected: not supported by boiler");
    }
}
