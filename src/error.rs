// ABOUTME: Custom error types for provisioning and replication testing
// ABOUTME: Classifies failures so callers can tell environment, command, and convergence errors apart

use std::fmt;

#[derive(Debug)]
pub enum SetupError {
    /// Not root, unsupported OS, missing tools or invalid arguments.
    Environment(String),
    /// An external program exited unsuccessfully.
    Command {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    /// A bounded wait ran out of time.
    Timeout(String),
    Connection(String),
    /// Replicated state did not match between the two instances.
    Verification(String),
}

impl SetupError {
    pub fn command(
        program: impl Into<String>,
        status: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        SetupError::Command {
            program: program.into(),
            status,
            stderr: stderr.into(),
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::Environment(msg) => write!(f, "Environment error: {}", msg),
            SetupError::Command {
                program,
                status,
                stderr,
            } => {
                match status {
                    Some(code) => {
                        write!(f, "Command error: {} exited with status {}", program, code)?
                    }
                    None => write!(f, "Command error: {} was terminated by a signal", program)?,
                }
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, "\n{}", stderr)?;
                }
                Ok(())
            }
            SetupError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            SetupError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SetupError::Verification(msg) => write!(f, "Verification failed: {}", msg),
        }
    }
}

impl std::error::Error for SetupError {}
