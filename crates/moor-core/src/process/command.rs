//! Worker launch command construction.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

/// A program invocation plus the environment it runs with.
///
/// For local launches the environment is passed to the child directly. When
/// wrapped for a remote host, the variables are also exported inside the
/// remote command string since remote shells do not forward them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Render as a single POSIX shell command line, environment exports first:
    ///
    /// ```text
    /// export K='v' && export K2='v2' && program 'arg1' 'arg2'
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("export {}={}", k, shell_quote(v)))
            .collect();
        let mut invocation = shell_quote(&self.program).into_owned();
        for arg in &self.args {
            invocation.push(' ');
            invocation.push_str(&shell_quote(arg));
        }
        parts.push(invocation);
        parts.join(" && ")
    }

    /// Wrap this command so it runs on `host` through `shell` (e.g. `ssh`).
    pub fn wrap_remote(self, shell: &str, host: &str) -> Self {
        let remote = self.to_shell_string();
        Self {
            program: shell.to_string(),
            args: vec![host.to_string(), remote],
            env: self.env,
            working_dir: self.working_dir,
        }
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so stop() can signal the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote a word for a POSIX shell. Plain words are returned unchanged.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.sh"), "plain-word_1.sh");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_shell_string_exports_env_first() {
        let cmd = LaunchCommand::new("/opt/moor/bin/moor-worker")
            .args(["--group-id", "sh-1"])
            .env("SPARK_HOME", "/opt/spark")
            .env("A_FLAG", "x y");

        assert_eq!(
            cmd.to_shell_string(),
            "export A_FLAG='x y' && export SPARK_HOME=/opt/spark && /opt/moor/bin/moor-worker --group-id sh-1"
        );
    }

    #[test]
    fn test_wrap_remote() {
        let cmd = LaunchCommand::new("moor-worker")
            .arg("--callback-port")
            .arg("4000")
            .env("K", "v")
            .wrap_remote("ssh", "emr-header-1");

        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args[0], "emr-header-1");
        assert_eq!(cmd.args[1], "export K=v && moor-worker --callback-port 4000");
        assert_eq!(cmd.env.get("K").map(String::as_str), Some("v"));
    }
}
