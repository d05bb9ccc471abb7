use std::{
    fs::File,
    io::{BufRead as _, BufReader},
    path::Path,
    sync::LazyLock,
};

use chrono::Utc;
use regex::Regex;
use test_system_shared::models::CommandResult;

use super::{ExecStats, Executor};
use crate::CommandError;

static INTERPRETER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#!(?P<python_interpreter>.*(python[2-4]?))(?P<options> .*)?")
        .expect("interpreter regex is valid")
});

/// Runs python scripts, honoring an interpreter pinned in the script's
/// shebang line.
pub struct PythonExecutor {
    inner: Executor,
}

impl PythonExecutor {
    #[must_use]
    pub fn new(inner: Executor) -> Self {
        Self { inner }
    }

    /// Interpreter and options for the script about to run. `--version`
    /// short-circuits to the configured binary.
    fn detect_python_binary(
        &self,
        cmd_args: &[String],
        workdir: &Path,
    ) -> (String, Option<String>) {
        let fallback = (self.inner.binary_name().to_owned(), None);
        if cmd_args.is_empty() || cmd_args.iter().any(|arg| arg == "--version") {
            return fallback;
        }
        let script_path = workdir.join(&cmd_args[0]);
        let Ok(file) = File::open(&script_path) else {
            return fallback;
        };
        let mut shebang = String::new();
        if BufReader::new(file).read_line(&mut shebang).is_err() {
            return fallback;
        }
        let Some(captures) = INTERPRETER_REGEX.captures(shebang.trim_end()) else {
            return fallback;
        };
        let interpreter = captures
            .name("python_interpreter")
            .map_or_else(|| self.inner.binary_name().to_owned(), |m| m.as_str().to_owned());
        let options = captures
            .name("options")
            .map(|m| m.as_str().trim().to_owned())
            .filter(|options| !options.is_empty());
        (interpreter, options)
    }

    fn prepare_args(&mut self, cmd_args: &[String], workdir: &Path) -> Vec<String> {
        let (interpreter, options) = self.detect_python_binary(cmd_args, workdir);
        self.inner.set_binary(interpreter);
        let mut args = Vec::with_capacity(cmd_args.len() + 1);
        if let Some(options) = options {
            args.push(options);
        }
        args.extend_from_slice(cmd_args);
        args
    }

    pub async fn run_local(
        &mut self,
        cmd_args: &[String],
        workdir: &Path,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let args = self.prepare_args(cmd_args, workdir);
        let result = self.inner.run_local_command(&args, Some(workdir)).await;
        self.inner.record_stage("run_local_python", started);
        result
    }

    pub async fn run_ssh(
        &mut self,
        cmd_args: &[String],
        workdir: &Path,
    ) -> Result<CommandResult, CommandError> {
        let started = Utc::now();
        let args = self.prepare_args(cmd_args, workdir);
        let result = self.inner.run_ssh_command(&args).await;
        self.inner.record_stage("run_ssh_python", started);
        result
    }

    #[must_use]
    pub fn exec_stats(&self) -> &ExecStats {
        self.inner.exec_stats()
    }

    #[must_use]
    pub fn binary_name(&self) -> &str {
        self.inner.binary_name()
    }
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new(Executor::new("python3"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_script(dir: &Path, name: &str, first_line: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        writeln!(file, "{first_line}").unwrap();
        writeln!(file, "print('ok')").unwrap();
    }

    #[test]
    fn shebang_pins_the_interpreter() {
        let workdir = tempfile::tempdir().unwrap();
        write_script(workdir.path(), "pinned.py", "#!/usr/bin/python2 -u");

        let executor = PythonExecutor::default();
        let (interpreter, options) =
            executor.detect_python_binary(&["pinned.py".to_owned()], workdir.path());
        assert_eq!(interpreter, "/usr/bin/python2");
        assert_eq!(options.as_deref(), Some("-u"));
    }

    #[test]
    fn plain_scripts_keep_the_default_binary() {
        let workdir = tempfile::tempdir().unwrap();
        write_script(workdir.path(), "plain.py", "import sys");

        let executor = PythonExecutor::default();
        let (interpreter, options) =
            executor.detect_python_binary(&["plain.py".to_owned()], workdir.path());
        assert_eq!(interpreter, "python3");
        assert_eq!(options, None);
    }

    #[test]
    fn version_flag_short_circuits() {
        let workdir = tempfile::tempdir().unwrap();
        let executor = PythonExecutor::default();
        let (interpreter, options) =
            executor.detect_python_binary(&["--version".to_owned()], workdir.path());
        assert_eq!(interpreter, "python3");
        assert_eq!(options, None);
    }
}
