// ABOUTME: Abstraction over the machine being provisioned (processes and files)
// ABOUTME: SystemHost runs real commands; dry runs print mutating actions instead of executing them

use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::SetupError;

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Data written to the child's stdin. Never logged.
    pub stdin: Option<String>,
    /// Read-only probes still run during a dry run.
    pub probe: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            probe: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn probe(mut self) -> Self {
        self.probe = true;
        self
    }

    /// Wraps the command so it runs as `user` through `sudo`.
    pub fn as_user(self, user: &str) -> Self {
        let mut wrapped = CommandSpec::new("sudo").args(["-u", user]).arg(self.program);
        wrapped.args.extend(self.args);
        wrapped.stdin = self.stdin;
        wrapped.probe = self.probe;
        wrapped
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            let needs_quotes =
                arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"');
            if needs_quotes {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// The machine that provisioning acts upon.
#[allow(async_fn_in_trait)]
pub trait Host {
    /// Runs a command to completion. A non-zero exit is not an error here.
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Replaces `path` with `contents` and applies `mode`.
    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<String>;

    async fn path_exists(&self, path: &Path) -> bool;

    fn has_program(&self, name: &str) -> bool;

    fn is_dry_run(&self) -> bool {
        false
    }

    /// Runs a command and turns a non-zero exit into [`SetupError::Command`].
    async fn run_checked(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(cmd).await?;
        if !output.success() {
            return Err(SetupError::command(cmd.to_string(), output.status, output.stderr).into());
        }
        Ok(output)
    }
}

/// The local machine.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    dry_run: bool,
}

impl SystemHost {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl Host for SystemHost {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        if self.dry_run && !cmd.probe {
            println!("[dry-run] {}", cmd);
            return Ok(CommandOutput::ok(""));
        }

        debug!("Running: {}", cmd);
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .with_context(|| format!("Failed to write stdin of {}", cmd.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", cmd.program))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        if self.dry_run {
            println!(
                "[dry-run] write {} ({} bytes, mode {:o})",
                path.display(),
                contents.len(),
                mode
            );
            return Ok(());
        }

        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        let mut file = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
        file.write_all(contents.as_bytes())?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
        file.persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    fn has_program(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording host for exercising provisioning sequences without side effects.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHost {
        pub log: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, CommandOutput)>>,
        pub files: Mutex<HashMap<PathBuf, String>>,
        existing: Mutex<HashSet<PathBuf>>,
        missing_programs: Mutex<HashSet<String>>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commands whose rendering starts with `prefix` return `output`.
        /// Later registrations take precedence.
        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            self.responses
                .lock()
                .unwrap()
                .push((prefix.to_string(), output));
        }

        pub fn add_path(&self, path: impl Into<PathBuf>) {
            self.existing.lock().unwrap().insert(path.into());
        }

        pub fn remove_program(&self, name: &str) {
            self.missing_programs
                .lock()
                .unwrap()
                .insert(name.to_string());
        }

        pub fn commands(&self) -> Vec<String> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|entry| entry.strip_prefix("run: ").map(str::to_string))
                .collect()
        }

        pub fn ran(&self, prefix: &str) -> bool {
            self.commands().iter().any(|c| c.starts_with(prefix))
        }

        pub fn file(&self, path: &str) -> Option<String> {
            self.files.lock().unwrap().get(Path::new(path)).cloned()
        }
    }

    impl Host for FakeHost {
        async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
            let rendered = cmd.to_string();
            self.log.lock().unwrap().push(format!("run: {}", rendered));
            let responses = self.responses.lock().unwrap();
            let output = responses
                .iter()
                .rev()
                .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| CommandOutput::ok(""));
            Ok(output)
        }

        async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("write: {} {:o}", path.display(), mode));
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), contents.to_string());
            Ok(())
        }

        async fn read_file(&self, path: &Path) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .with_context(|| format!("no such file {}", path.display()))
        }

        async fn path_exists(&self, path: &Path) -> bool {
            self.existing.lock().unwrap().contains(path)
                || self.files.lock().unwrap().contains_key(path)
        }

        fn has_program(&self, name: &str) -> bool {
            !self.missing_programs.lock().unwrap().contains(name)
        }
    }
}
