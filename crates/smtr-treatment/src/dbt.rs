//! Building and running dbt invocations.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use smtr_core::config::DbtConfig;
use smtr_core::RunEnv;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, TreatmentError};
use crate::window::MaterializationWindow;

pub const DATE_RANGE_START_VAR: &str = "date_range_start";
pub const DATE_RANGE_END_VAR: &str = "date_range_end";

/// Output kept per stream in reports.
const MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbtAction {
    Run,
    Test,
}

impl DbtAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbtAction::Run => "run",
            DbtAction::Test => "test",
        }
    }
}

/// One dbt invocation, minus the binary and project location.
#[derive(Debug, Clone, Serialize)]
pub struct DbtCommand {
    action: DbtAction,
    select: Vec<String>,
    target: RunEnv,
    vars: Map<String, Value>,
    flags: Vec<String>,
}

impl DbtCommand {
    /// `dbt run --selector <name>`.
    pub fn run(selector: &str, target: RunEnv) -> Self {
        Self {
            action: DbtAction::Run,
            select: vec![selector.to_string()],
            target,
            vars: Map::new(),
            flags: Vec::new(),
        }
    }

    /// `dbt test --select <models...>`; `select` is whitespace-separated.
    pub fn test(select: &str, target: RunEnv) -> Self {
        Self {
            action: DbtAction::Test,
            select: select.split_whitespace().map(str::to_string).collect(),
            target,
            vars: Map::new(),
            flags: Vec::new(),
        }
    }

    pub fn window(self, window: &MaterializationWindow) -> Self {
        let (start, end) = window.as_vars();
        self.var(DATE_RANGE_START_VAR, Value::String(start))
            .var(DATE_RANGE_END_VAR, Value::String(end))
    }

    pub fn var(mut self, key: &str, value: Value) -> Self {
        self.vars.insert(key.to_string(), value);
        self
    }

    /// Merge extra vars; the window vars cannot be overridden this way.
    pub fn vars(mut self, extra: &Map<String, Value>) -> Self {
        for (key, value) in extra {
            if key == DATE_RANGE_START_VAR || key == DATE_RANGE_END_VAR {
                warn!(var = %key, "ignoring additional var that shadows the run window");
                continue;
            }
            self.vars.insert(key.clone(), value.clone());
        }
        self
    }

    /// Appended verbatim after the generated arguments.
    pub fn flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn action(&self) -> DbtAction {
        self.action
    }

    pub fn vars_map(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Arguments after the dbt binary.
    pub fn args(&self) -> Result<Vec<String>> {
        let mut args = vec![self.action.as_str().to_string()];
        match self.action {
            DbtAction::Run => args.push("--selector".to_string()),
            DbtAction::Test => args.push("--select".to_string()),
        }
        args.extend(self.select.iter().cloned());
        args.push("--target".to_string());
        args.push(self.target.as_str().to_string());
        if !self.vars.is_empty() {
            args.push("--vars".to_string());
            args.push(serde_json::to_string(&self.vars)?);
        }
        args.extend(self.flags.iter().cloned());
        Ok(args)
    }
}

/// Exit status and captured output of a finished dbt process.
#[derive(Debug, Clone, Serialize)]
pub struct DbtOutput {
    pub action: DbtAction,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl DbtOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ensure_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(TreatmentError::DbtFailed {
                command: self.action.as_str().to_string(),
                exit_code: self.exit_code,
            })
        }
    }
}

/// Spawns dbt with a deadline.
#[derive(Debug, Clone)]
pub struct DbtRunner {
    /// Program plus leading arguments, e.g. `["uv", "run", "dbt"]`.
    program: Vec<String>,
    project_dir: PathBuf,
    profiles_dir: Option<PathBuf>,
    timeout: Duration,
}

impl DbtRunner {
    /// `binary` may carry a launcher prefix (`uv run dbt`); it is split on
    /// whitespace.
    pub fn new(binary: &str, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: binary.split_whitespace().map(str::to_string).collect(),
            project_dir: project_dir.into(),
            profiles_dir: None,
            timeout: Duration::from_secs(smtr_core::config::DEFAULT_DBT_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &DbtConfig) -> Self {
        let mut runner = Self::new(&config.binary, &config.project_dir)
            .with_timeout(Duration::from_secs(config.timeout_secs));
        runner.profiles_dir = config.profiles_dir.as_ref().map(PathBuf::from);
        runner
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full argument vector after the program name.
    fn argv(&self, command: &DbtCommand) -> Result<Vec<String>> {
        let mut argv: Vec<String> = self.program.iter().skip(1).cloned().collect();
        argv.extend(command.args()?);
        argv.push("--project-dir".to_string());
        argv.push(self.project_dir.to_string_lossy().into_owned());
        if let Some(profiles) = &self.profiles_dir {
            argv.push("--profiles-dir".to_string());
            argv.push(profiles.to_string_lossy().into_owned());
        }
        Ok(argv)
    }

    /// Run `command` to completion. A non-zero exit is reported in the
    /// output, not as an error; spawn failures and timeouts are errors.
    pub async fn execute(&self, command: &DbtCommand) -> Result<DbtOutput> {
        let Some(program) = self.program.first() else {
            return Err(TreatmentError::Spawn("empty dbt binary".to_string()));
        };
        let args = command.args()?;
        let argv = self.argv(command)?;
        debug!(program, ?argv, "spawning dbt");

        let child = Command::new(program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TreatmentError::Spawn(format!("{program}: {e}")))?;

        let started = Instant::now();
        // Dropping the pending future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                warn!(action = command.action().as_str(), "dbt timed out");
                return Err(TreatmentError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let result = DbtOutput {
            action: command.action(),
            args,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: tail(&output.stdout),
            stderr: tail(&output.stderr),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            action = command.action().as_str(),
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "dbt finished"
        );
        Ok(result)
    }
}

/// Last `MAX_OUTPUT_CHARS` characters of a stream, lossily decoded.
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let count = text.chars().count();
    if count <= MAX_OUTPUT_CHARS {
        return text.into_owned();
    }
    text.chars().skip(count - MAX_OUTPUT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smtr_core::parse_timestamp;

    fn window() -> MaterializationWindow {
        MaterializationWindow {
            start: parse_timestamp("2025-04-01 08:00").unwrap(),
            end: parse_timestamp("2025-04-01 09:00").unwrap(),
        }
    }

    #[test]
    fn run_command_arguments() {
        let mut extra = Map::new();
        extra.insert("version".into(), json!("v2"));
        extra.insert(DATE_RANGE_END_VAR.into(), json!("2030-01-01 00:00:00"));

        let args = DbtCommand::run("gps_validador", RunEnv::Dev)
            .window(&window())
            .vars(&extra)
            .flags(["--full-refresh"])
            .args()
            .unwrap();

        assert_eq!(
            &args[..5],
            &["run", "--selector", "gps_validador", "--target", "dev"]
        );
        assert_eq!(args[5], "--vars");
        let vars: Value = serde_json::from_str(&args[6]).unwrap();
        assert_eq!(
            vars,
            json!({
                "date_range_start": "2025-04-01 08:00:00",
                "date_range_end": "2025-04-01 09:00:00",
                "version": "v2",
            })
        );
        assert_eq!(args[7], "--full-refresh");
    }

    #[test]
    fn test_command_splits_selection() {
        let args = DbtCommand::test("gps_validador gps_validador_van", RunEnv::Prod)
            .args()
            .unwrap();
        assert_eq!(
            args,
            vec!["test", "--select", "gps_validador", "gps_validador_van", "--target", "prod"]
        );
    }

    #[test]
    fn launcher_prefix_and_project_flags() {
        let config = DbtConfig {
            binary: "uv run dbt".into(),
            project_dir: "queries".into(),
            profiles_dir: Some("profiles".into()),
            ..DbtConfig::default()
        };
        let runner = DbtRunner::from_config(&config);
        let argv = runner
            .argv(&DbtCommand::test("cadastro", RunEnv::Dev))
            .unwrap();
        assert_eq!(runner.program[0], "uv");
        assert_eq!(&argv[..3], &["run", "dbt", "test"]);
        assert!(argv.ends_with(&[
            "--project-dir".to_string(),
            "queries".to_string(),
            "--profiles-dir".to_string(),
            "profiles".to_string(),
        ]));
    }

    #[test]
    fn output_tail_keeps_the_end() {
        let long = "a".repeat(MAX_OUTPUT_CHARS) + "end";
        let kept = tail(long.as_bytes());
        assert_eq!(kept.chars().count(), MAX_OUTPUT_CHARS);
        assert!(kept.ends_with("end"));
    }
}
