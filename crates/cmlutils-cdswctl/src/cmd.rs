//! Command lines for `cdswctl` invocations.
//!
//! Arguments marked secret are replaced by a placeholder whenever the command
//! is rendered, so command lines can be logged and put in errors safely.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

/// A program plus arguments, some of which may be secret.
#[derive(Clone)]
pub struct CommandLine {
    program: PathBuf,
    args: Vec<String>,
    /// `(index into args, placeholder)` for each secret argument.
    secrets: Vec<(usize, &'static str)>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            secrets: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that is rendered as `<placeholder>`.
    #[must_use]
    pub fn secret_arg(mut self, arg: impl Into<String>, placeholder: &'static str) -> Self {
        self.secrets.push((self.args.len(), placeholder));
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The real arguments, secrets included. Do not log these.
    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Program and arguments joined by spaces, secrets masked.
    pub fn render(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for (i, arg) in self.args.iter().enumerate() {
            rendered.push(' ');
            match self.secrets.iter().find(|(idx, _)| *idx == i) {
                Some((_, placeholder)) => {
                    rendered.push('<');
                    rendered.push_str(placeholder);
                    rendered.push('>');
                }
                None => rendered.push_str(arg),
            }
        }
        rendered
    }

    /// Replace every occurrence of a secret value in `text` (e.g. captured
    /// stderr that echoes the command back).
    pub fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for (idx, placeholder) in &self.secrets {
            if let Some(secret) = self.args.get(*idx).filter(|s| !s.is_empty()) {
                scrubbed = scrubbed.replace(secret.as_str(), &format!("<{placeholder}>"));
            }
        }
        scrubbed
    }

    /// Build a tokio command with stdin closed.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(std::process::Stdio::null());
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandLine").field(&self.render()).finish()
    }
}
