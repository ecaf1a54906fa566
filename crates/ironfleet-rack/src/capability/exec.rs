//! Command-backed drivers
//!
//! Both drivers run an operator-supplied program. Machine and BMC details are
//! passed through the environment so that credentials never show up in the
//! process list.
//!
//! Power: `<program> [args..] <query|on|off|cycle>`
//!
//! | exit | meaning |
//! |---|---|
//! | 0 | ok (`query` prints `on` or `off`) |
//! | 3 | BMC busy |
//! | 4 | bad credentials |
//! | 5 | unsupported |
//! | 6 | already in requested state |
//! | 75 | transport failure |
//!
//! Scripts: `<program> [args..] <script-set>`. Exit 0 means passed; output
//! lines of the form `fact:key=value` are collected as hardware facts.

use super::{DriverError, DriverErrorKind, PowerDriver, ScriptRunner};
use async_trait::async_trait;
use ironfleet_core::models::{PowerAction, PowerState, PowerTarget, ScriptOutcome};
use std::collections::BTreeMap;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

const EXIT_BUSY: i32 = 3;
const EXIT_BAD_CREDENTIALS: i32 = 4;
const EXIT_UNSUPPORTED: i32 = 5;
const EXIT_ALREADY_IN_STATE: i32 = 6;
/// sysexits `EX_TEMPFAIL`
const EXIT_TRANSPORT: i32 = 75;

/// Split `"program arg1 arg2"` into program and leading arguments.
fn split_command(command: &str) -> (String, Vec<String>) {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_default();
    (program, parts.collect())
}

fn base_command(program: &str, args: &[String], target: &PowerTarget) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("IRONFLEET_MACHINE_ID", target.machine.to_string())
        .env("IRONFLEET_POWER_DRIVER", &target.power.driver)
        .env("IRONFLEET_POWER_ADDRESS", &target.power.address)
        .kill_on_drop(true);
    if let Some(user) = &target.power.username {
        cmd.env("IRONFLEET_POWER_USER", user);
    }
    if let Some(password) = &target.power.password {
        cmd.env("IRONFLEET_POWER_PASSWORD", password);
    }
    for (key, value) in &target.power.parameters {
        let key = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>();
        cmd.env(format!("IRONFLEET_POWER_PARAM_{key}"), value);
    }
    cmd
}

async fn run(mut cmd: Command, what: &str) -> Result<Output, DriverError> {
    cmd.output().await.map_err(|e| {
        DriverError::new(
            DriverErrorKind::Failed,
            format!("failed to spawn {what}: {e}"),
        )
    })
}

/// Map a power command's exit status onto a driver result.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> Result<(), DriverError> {
    let message = || {
        let stderr = stderr.trim();
        if stderr.is_empty() {
            format!("power command exited with {code:?}")
        } else {
            stderr.to_string()
        }
    };
    match code {
        Some(0) => Ok(()),
        Some(EXIT_BUSY) => Err(DriverError::new(DriverErrorKind::Busy, message())),
        Some(EXIT_BAD_CREDENTIALS) => Err(DriverError::new(DriverErrorKind::BadCredentials, message())),
        Some(EXIT_UNSUPPORTED) => Err(DriverError::new(DriverErrorKind::Unsupported, message())),
        Some(EXIT_ALREADY_IN_STATE) => Err(DriverError::new(DriverErrorKind::AlreadyInState, message())),
        Some(EXIT_TRANSPORT) => Err(DriverError::new(DriverErrorKind::Transport, message())),
        // Killed by a signal
        None => Err(DriverError::new(DriverErrorKind::Transport, message())),
        Some(_) => Err(DriverError::new(DriverErrorKind::Failed, message())),
    }
}

/// Read `on` / `off` from the first non-empty line of query output.
pub fn parse_power_state(stdout: &str) -> Result<PowerState, DriverError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match line.as_str() {
        "on" | "power on" | "chassis power is on" => Ok(PowerState::On),
        "off" | "power off" | "chassis power is off" => Ok(PowerState::Off),
        other => Err(DriverError::new(
            DriverErrorKind::Failed,
            format!("unrecognised power state '{other}'"),
        )),
    }
}

/// Collect `fact:key=value` lines.
pub fn parse_facts(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("fact:"))
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExecPowerDriver {
    program: String,
    args: Vec<String>,
}

impl ExecPowerDriver {
    pub fn new(command: &str) -> Self {
        let (program, args) = split_command(command);
        Self { program, args }
    }

    async fn invoke(&self, target: &PowerTarget, verb: &str) -> Result<Output, DriverError> {
        let mut cmd = base_command(&self.program, &self.args, target);
        cmd.arg(verb);
        debug!(machine_id = %target.machine, verb, program = %self.program, "Running power command");
        run(cmd, "power command").await
    }
}

#[async_trait]
impl PowerDriver for ExecPowerDriver {
    async fn query(&self, target: &PowerTarget) -> Result<PowerState, DriverError> {
        let output = self.invoke(target, "query").await?;
        classify_exit(output.status.code(), &String::from_utf8_lossy(&output.stderr))?;
        parse_power_state(&String::from_utf8_lossy(&output.stdout))
    }

    async fn set_power(&self, target: &PowerTarget, action: PowerAction) -> Result<(), DriverError> {
        let output = self.invoke(target, &action.to_string()).await?;
        classify_exit(output.status.code(), &String::from_utf8_lossy(&output.stderr))
    }
}

#[derive(Debug, Clone)]
pub struct ExecScriptRunner {
    program: String,
    args: Vec<String>,
}

impl ExecScriptRunner {
    pub fn new(command: &str) -> Self {
        let (program, args) = split_command(command);
        Self { program, args }
    }
}

#[async_trait]
impl ScriptRunner for ExecScriptRunner {
    async fn run_scripts(
        &self,
        target: &PowerTarget,
        script_set: &str,
    ) -> Result<ScriptOutcome, DriverError> {
        let mut cmd = base_command(&self.program, &self.args, target);
        cmd.arg(script_set)
            .env("IRONFLEET_SCRIPT_SET", script_set);
        debug!(machine_id = %target.machine, script_set, program = %self.program, "Running script set");
        let output = run(cmd, "script command").await?;

        let code = output.status.code();
        if code == Some(EXIT_TRANSPORT) {
            return Err(DriverError::new(
                DriverErrorKind::Transport,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut logs = stdout.to_string();
        if !stderr.is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&stderr);
        }

        Ok(ScriptOutcome {
            passed: code == Some(0),
            facts: parse_facts(&stdout),
            logs,
            exit_code: code,
        })
    }
}
