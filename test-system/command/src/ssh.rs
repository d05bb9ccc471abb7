//! SSH command execution over control-master sessions.
//!
//! Two client shapes are exposed: [`SshClient`] opens one connection per
//! call, [`LongRunSshClient`] owns an explicit long-lived session. Both shape
//! every failure into a [`CommandResult`] so callers never observe a
//! mid-flight error.

use std::{collections::BTreeMap, fmt::Write as _, io::Write as _, path::PathBuf, time::Duration};

use openssh::{KnownHosts, Session, SessionBuilder};
use tempfile::NamedTempFile;
use test_system_shared::{constants::DEFAULT_SSH_AUTH_METHODS, models::CommandResult};
use tracing::{debug, warn};

/// Connection parameters shared by both client shapes.
#[derive(Clone, Debug)]
pub struct SshParams {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Option<Duration>,
    pub client_key_files: Vec<PathBuf>,
    pub known_hosts_files: Vec<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
    pub disable_known_hosts_check: bool,
    pub keepalive_interval: u64,
    pub keepalive_count_max: u32,
    pub preferred_auth: Vec<String>,
}

impl SshParams {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            timeout: None,
            client_key_files: Vec::new(),
            known_hosts_files: Vec::new(),
            env_vars: BTreeMap::new(),
            disable_known_hosts_check: false,
            keepalive_interval: 0,
            keepalive_count_max: 3,
            preferred_auth: DEFAULT_SSH_AUTH_METHODS.map(str::to_owned).to_vec(),
        }
    }
}

/// One-shot client: each call opens a connection, runs the command(s) and
/// closes on exit.
pub struct SshClient {
    params: SshParams,
    config: Option<NamedTempFile>,
}

impl SshClient {
    pub fn new(params: SshParams) -> std::io::Result<Self> {
        if params.password.is_some() {
            // The ssh transport only does key and GSSAPI auth
            // non-interactively; the password is accepted for parameter
            // compatibility and otherwise ignored.
            debug!(host = %params.host, "ssh password supplied; key-based auth will be attempted");
        }
        let config = write_config_file(&params)?;
        Ok(Self { params, config })
    }

    #[must_use]
    pub fn params(&self) -> &SshParams {
        &self.params
    }

    pub(crate) async fn open_session(&self) -> Result<Session, openssh::Error> {
        let mut builder = SessionBuilder::default();
        if let Some(username) = &self.params.username {
            builder.user(username.clone());
        }
        if let Some(keyfile) = self.params.client_key_files.first() {
            builder.keyfile(keyfile);
        }
        builder.known_hosts_check(if self.params.disable_known_hosts_check {
            KnownHosts::Accept
        } else {
            KnownHosts::Add
        });
        if let Some(timeout) = self.params.timeout {
            builder.connect_timeout(timeout);
        }
        if self.params.keepalive_interval > 0 {
            builder.server_alive_interval(Duration::from_secs(self.params.keepalive_interval));
        }
        if let Some(config) = &self.config {
            builder.config_file(config.path());
        }
        builder.connect(&self.params.host).await
    }

    /// Runs one command over a fresh connection.
    pub async fn run_command(&self, command: &str, timeout: Option<Duration>) -> CommandResult {
        let session = match self.open_session().await {
            Ok(session) => session,
            Err(error) => return failure_result(&error.to_string()),
        };
        let result = run_on_session(
            &session,
            command,
            timeout.or(self.params.timeout),
            &self.params.env_vars,
        )
        .await;
        close_session(session).await;
        result
    }

    /// Runs commands sequentially on one connection, mapping each command to
    /// its result.
    pub async fn run_commands(&self, commands: &[String]) -> BTreeMap<String, CommandResult> {
        let mut results = BTreeMap::new();
        match self.open_session().await {
            Ok(session) => {
                for command in commands {
                    let result = run_on_session(
                        &session,
                        command,
                        self.params.timeout,
                        &self.params.env_vars,
                    )
                    .await;
                    results.insert(command.clone(), result);
                }
                close_session(session).await;
            }
            Err(error) => {
                let failure = failure_result(&error.to_string());
                for command in commands {
                    results.insert(command.clone(), failure.clone());
                }
            }
        }
        results
    }
}

/// Client owning an explicit long-lived session. A dead control master is
/// detected before each command and the client reconnects once,
/// transparently to the caller.
pub struct LongRunSshClient {
    inner: SshClient,
    session: Option<Session>,
}

impl LongRunSshClient {
    pub fn new(params: SshParams) -> std::io::Result<Self> {
        Ok(Self {
            inner: SshClient::new(params)?,
            session: None,
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), openssh::Error> {
        if self.session.is_none() {
            self.session = Some(self.inner.open_session().await?);
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            close_session(session).await;
        }
    }

    pub async fn run_command(&mut self, command: &str, timeout: Option<Duration>) -> CommandResult {
        if let Err(error) = self.ensure_session().await {
            return failure_result(&error.to_string());
        }
        match &self.session {
            Some(session) => {
                run_on_session(
                    session,
                    command,
                    timeout.or(self.inner.params.timeout),
                    &self.inner.params.env_vars,
                )
                .await
            }
            None => failure_result("ssh session is not connected"),
        }
    }

    pub async fn run_commands(&mut self, commands: &[String]) -> BTreeMap<String, CommandResult> {
        let mut results = BTreeMap::new();
        for command in commands {
            let result = self.run_command(command, None).await;
            results.insert(command.clone(), result);
        }
        results
    }

    /// Explicit close; the owner must call this, `Drop` cannot await.
    pub async fn close(&mut self) {
        self.disconnect().await;
    }

    async fn ensure_session(&mut self) -> Result<(), openssh::Error> {
        let alive = match &self.session {
            Some(session) => session.check().await.is_ok(),
            None => false,
        };
        if !alive {
            self.disconnect().await;
            self.connect().await?;
        }
        Ok(())
    }
}

async fn run_on_session(
    session: &Session,
    command: &str,
    timeout: Option<Duration>,
    env_vars: &BTreeMap<String, String>,
) -> CommandResult {
    let command_line = with_env(command, env_vars);
    let mut shell = session.shell(&command_line);
    let future = shell.output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(output) => output,
            Err(_) => {
                return failure_result(&format!("ssh command timed out after {limit:?}"));
            }
        },
        None => future.await,
    };
    match output {
        Ok(output) => CommandResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Err(error) => failure_result(&error.to_string()),
    }
}

async fn close_session(session: Session) {
    if let Err(error) = session.close().await {
        warn!(error = %error, "ssh session close failed");
    }
}

/// Prefixes the command with `env K=V …` so remote commands see the
/// configured variables without relying on server-side `AcceptEnv`.
fn with_env(command: &str, env_vars: &BTreeMap<String, String>) -> String {
    if env_vars.is_empty() {
        return command.to_owned();
    }
    let mut line = String::from("env");
    for (key, value) in env_vars {
        let _ = write!(line, " {key}={value}");
    }
    let _ = write!(line, " {command}");
    line
}

fn failure_result(stderr: &str) -> CommandResult {
    CommandResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

/// Options the session builder does not expose go through a generated ssh
/// config file: preferred auth order, known-hosts files, keepalive budget.
fn write_config_file(params: &SshParams) -> std::io::Result<Option<NamedTempFile>> {
    if params.preferred_auth.is_empty() && params.known_hosts_files.is_empty() {
        return Ok(None);
    }
    let mut content = String::from("Host *\n");
    if !params.preferred_auth.is_empty() {
        let _ = writeln!(
            content,
            "  PreferredAuthentications {}",
            params.preferred_auth.join(",")
        );
    }
    if !params.known_hosts_files.is_empty() {
        let paths = params
            .known_hosts_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(content, "  UserKnownHostsFile {paths}");
    }
    let _ = writeln!(content, "  ServerAliveCountMax {}", params.keepalive_count_max);

    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_results_keep_the_contract_shape() {
        let result = failure_result("connection reset");
        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.is_empty());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn env_vars_prefix_the_command() {
        let env_vars = BTreeMap::from([
            ("ANSIBLE_FORCE_COLOR".to_owned(), "0".to_owned()),
            ("LC_ALL".to_owned(), "C".to_owned()),
        ]);
        assert_eq!(
            with_env("uname -a", &env_vars),
            "env ANSIBLE_FORCE_COLOR=0 LC_ALL=C uname -a"
        );
        assert_eq!(with_env("uname -a", &BTreeMap::new()), "uname -a");
    }

    #[test]
    fn config_file_carries_auth_and_known_hosts() {
        let mut params = SshParams::new("198.51.100.7");
        params.known_hosts_files = vec![PathBuf::from("/tmp/known_hosts")];
        params.keepalive_count_max = 5;

        let file = write_config_file(&params).unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains(
            "PreferredAuthentications gssapi-keyex,gssapi-with-mic,hostbased,publickey"
        ));
        assert!(content.contains("UserKnownHostsFile /tmp/known_hosts"));
        assert!(content.contains("ServerAliveCountMax 5"));
    }

    #[test]
    fn default_params_use_the_standard_auth_order() {
        let params = SshParams::new("host");
        assert_eq!(
            params.preferred_auth,
            vec!["gssapi-keyex", "gssapi-with-mic", "hostbased", "publickey"]
        );
        assert_eq!(params.keepalive_count_max, 3);
        assert!(!params.disable_known_hosts_check);
    }
}
