//! Tool catalog
//!
//! Every tool maps a small, validated JSON input onto one sandboxed command.
//! Inputs are checked here (identifier character classes, line caps, enum
//! targets) before anything reaches the sandbox, which then applies its own
//! policy on top.

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::ToolError;
use crate::llm::Tool;
use crate::sandbox::is_http_url;

/// Most lines any log-style tool will return
pub const MAX_LINES: u32 = 500;
const DEFAULT_LINES: u32 = 100;
const MAX_PROCESSES: usize = 50;
const DEFAULT_PROCESSES: usize = 15;

lazy_static! {
    /// Container names, systemd units, fail2ban jails
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@:-]{0,127}$").expect("identifier pattern");

    static ref DOMAIN: Regex = Regex::new(
        r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$"
    )
    .expect("domain pattern");

    /// rclone `remote:path`
    static ref REMOTE: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*:[A-Za-z0-9_./-]*$").expect("remote pattern");
}

// ═══════════════════════════════════════════════════════════════════════════
// Tool kinds
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ContainerStatus,
    ContainerLogs,
    ServiceStatus,
    ReadLog,
    ReadFile,
    ProcessList,
    DiskUsage,
    CertificateStatus,
    BackupStatus,
    BanStatus,
    HttpCheck,
    RunCommand,
}

impl ToolKind {
    pub const ALL: [ToolKind; 12] = [
        ToolKind::ContainerStatus,
        ToolKind::ContainerLogs,
        ToolKind::ServiceStatus,
        ToolKind::ReadLog,
        ToolKind::ReadFile,
        ToolKind::ProcessList,
        ToolKind::DiskUsage,
        ToolKind::CertificateStatus,
        ToolKind::BackupStatus,
        ToolKind::BanStatus,
        ToolKind::HttpCheck,
        ToolKind::RunCommand,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ContainerStatus => "container_status",
            ToolKind::ContainerLogs => "container_logs",
            ToolKind::ServiceStatus => "service_status",
            ToolKind::ReadLog => "read_log",
            ToolKind::ReadFile => "read_file",
            ToolKind::ProcessList => "process_list",
            ToolKind::DiskUsage => "disk_usage",
            ToolKind::CertificateStatus => "certificate_status",
            ToolKind::BackupStatus => "backup_status",
            ToolKind::BanStatus => "ban_status",
            ToolKind::HttpCheck => "http_check",
            ToolKind::RunCommand => "run_command",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ContainerStatus => {
                "List Docker containers with their status, or inspect one container's state, health and restart count."
            }
            ToolKind::ContainerLogs => "Show the most recent log lines of a Docker container.",
            ToolKind::ServiceStatus => "Show systemd status for a service unit, including recent journal lines.",
            ToolKind::ReadLog => {
                "Read the last lines of a well-known system log: syslog, auth, kern, nginx_access, nginx_error or fail2ban."
            }
            ToolKind::ReadFile => {
                "Read the first lines of a file by absolute path. Only non-sensitive locations under allowed roots can be read."
            }
            ToolKind::ProcessList => "List the top processes sorted by CPU or memory usage.",
            ToolKind::DiskUsage => "Show filesystem disk usage.",
            ToolKind::CertificateStatus => {
                "Show subject, issuer and expiry date of the Let's Encrypt certificate for a domain."
            }
            ToolKind::BackupStatus => "List files with sizes and timestamps on an rclone backup remote.",
            ToolKind::BanStatus => "Show fail2ban status overall, or for one jail including banned IPs.",
            ToolKind::HttpCheck => "Fetch the response headers of an http(s) URL to check that it is up.",
            ToolKind::RunCommand => {
                "Run a read-only diagnostic command from the allow-list, e.g. {\"program\": \"free\", \"argv\": [\"-h\"]}. No shell is involved; pipes and redirection are rejected."
            }
        }
    }

    /// JSON Schema for the tool's arguments
    pub fn parameters(self) -> serde_json::Value {
        let lines = json!({
            "type": "integer",
            "minimum": 1,
            "maximum": MAX_LINES,
            "description": format!("Number of lines (default {})", DEFAULT_LINES)
        });
        match self {
            ToolKind::ContainerStatus => json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Container name; omit to list all containers"}
                }
            }),
            ToolKind::ContainerLogs => json!({
                "type": "object",
                "properties": {
                    "container": {"type": "string", "description": "Container name or id"},
                    "lines": lines
                },
                "required": ["container"]
            }),
            ToolKind::ServiceStatus => json!({
                "type": "object",
                "properties": {
                    "unit": {"type": "string", "description": "systemd unit, e.g. nginx or nginx.service"}
                },
                "required": ["unit"]
            }),
            ToolKind::ReadLog => json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "enum": LogTarget::NAMES,
                    },
                    "lines": lines
                },
                "required": ["target"]
            }),
            ToolKind::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "lines": lines
                },
                "required": ["path"]
            }),
            ToolKind::ProcessList => json!({
                "type": "object",
                "properties": {
                    "sort_by": {"type": "string", "enum": ["cpu", "mem"]},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_PROCESSES}
                }
            }),
            ToolKind::DiskUsage => json!({"type": "object", "properties": {}}),
            ToolKind::CertificateStatus => json!({
                "type": "object",
                "properties": {
                    "domain": {"type": "string", "description": "e.g. example.com"}
                },
                "required": ["domain"]
            }),
            ToolKind::BackupStatus => json!({
                "type": "object",
                "properties": {
                    "remote": {"type": "string", "description": "rclone remote and path, e.g. b2:backups/server1"}
                },
                "required": ["remote"]
            }),
            ToolKind::BanStatus => json!({
                "type": "object",
                "properties": {
                    "jail": {"type": "string", "description": "Jail name; omit for the overview"}
                }
            }),
            ToolKind::HttpCheck => json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "http:// or https:// URL"}
                },
                "required": ["url"]
            }),
            ToolKind::RunCommand => json!({
                "type": "object",
                "properties": {
                    "program": {"type": "string", "description": "Program name, e.g. docker"},
                    "argv": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["program"]
            }),
        }
    }

    pub fn definition(self) -> Tool {
        Tool::function(self.name(), self.description(), self.parameters())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ContainerStatusInput {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerLogsInput {
    container: String,
    lines: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ServiceStatusInput {
    unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTarget {
    Syslog,
    Auth,
    Kern,
    NginxAccess,
    NginxError,
    Fail2ban,
}

impl LogTarget {
    const NAMES: [&'static str; 6] = ["syslog", "auth", "kern", "nginx_access", "nginx_error", "fail2ban"];

    pub fn path(self) -> &'static str {
        match self {
            LogTarget::Syslog => "/var/log/syslog",
            LogTarget::Auth => "/var/log/auth.log",
            LogTarget::Kern => "/var/log/kern.log",
            LogTarget::NginxAccess => "/var/log/nginx/access.log",
            LogTarget::NginxError => "/var/log/nginx/error.log",
            LogTarget::Fail2ban => "/var/log/fail2ban.log",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadLogInput {
    target: LogTarget,
    lines: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReadFileInput {
    path: String,
    lines: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SortBy {
    #[default]
    Cpu,
    Mem,
}

#[derive(Debug, Deserialize)]
struct ProcessListInput {
    #[serde(default)]
    sort_by: SortBy,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CertificateStatusInput {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct BackupStatusInput {
    remote: String,
}

#[derive(Debug, Deserialize)]
struct BanStatusInput {
    jail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HttpCheckInput {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RunCommandInput {
    program: String,
    #[serde(default)]
    argv: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Invocations
// ═══════════════════════════════════════════════════════════════════════════

/// How to render the command's result for the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// stdout, with stderr appended when present
    Text,
    /// `{"stdout", "stderr", "exitCode"}`
    Json,
}

/// A concrete command line for the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Exit codes that still mean "the tool worked"; `None` accepts any
    pub ok_exit_codes: Option<&'static [i32]>,
    /// Keep at most this many stdout lines (header included)
    pub max_stdout_lines: Option<usize>,
    pub format: OutputFormat,
}

impl Invocation {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            ok_exit_codes: Some(&[0]),
            max_stdout_lines: None,
            format: OutputFormat::Text,
        }
    }
}

fn parse<T: DeserializeOwned>(input: &serde_json::Value) -> Result<T, ToolError> {
    // Models sometimes send `null` for tools without arguments
    let input = if input.is_null() { json!({}) } else { input.clone() };
    serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(e.to_string()))
}

fn identifier<'a>(field: &str, value: &'a str) -> Result<&'a str, ToolError> {
    if IDENTIFIER.is_match(value) {
        Ok(value)
    } else {
        Err(ToolError::InvalidInput(format!(
            "{} must be letters, digits and _.@:- only, got {:?}",
            field, value
        )))
    }
}

fn line_count(lines: Option<u32>) -> Result<String, ToolError> {
    match lines.unwrap_or(DEFAULT_LINES) {
        n @ 1..=MAX_LINES => Ok(n.to_string()),
        n => Err(ToolError::InvalidInput(format!(
            "lines must be between 1 and {}, got {}",
            MAX_LINES, n
        ))),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Validate a tool's input and turn it into a command line
pub fn build_invocation(kind: ToolKind, input: &serde_json::Value) -> Result<Invocation, ToolError> {
    match kind {
        ToolKind::ContainerStatus => {
            let input: ContainerStatusInput = parse(input)?;
            Ok(match input.name {
                Some(name) => Invocation::new(
                    "docker",
                    vec![
                        "inspect".to_string(),
                        "--format".to_string(),
                        "{{.Name}} status={{.State.Status}} health={{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}} restarts={{.RestartCount}} started={{.State.StartedAt}} image={{.Config.Image}}".to_string(),
                        identifier("name", &name)?.to_string(),
                    ],
                ),
                None => Invocation::new(
                    "docker",
                    strings(&[
                        "ps",
                        "--all",
                        "--format",
                        "table {{.Names}}\t{{.Status}}\t{{.Image}}",
                    ]),
                ),
            })
        }
        ToolKind::ContainerLogs => {
            let input: ContainerLogsInput = parse(input)?;
            Ok(Invocation::new(
                "docker",
                vec![
                    "logs".to_string(),
                    "--tail".to_string(),
                    line_count(input.lines)?,
                    "--timestamps".to_string(),
                    identifier("container", &input.container)?.to_string(),
                ],
            ))
        }
        ToolKind::ServiceStatus => {
            let input: ServiceStatusInput = parse(input)?;
            let mut invocation = Invocation::new(
                "systemctl",
                vec![
                    "status".to_string(),
                    "--no-pager".to_string(),
                    "--lines".to_string(),
                    "20".to_string(),
                    identifier("unit", &input.unit)?.to_string(),
                ],
            );
            // 3 = inactive, 4 = no such unit; both are answers, not failures
            invocation.ok_exit_codes = Some(&[0, 1, 2, 3, 4]);
            Ok(invocation)
        }
        ToolKind::ReadLog => {
            let input: ReadLogInput = parse(input)?;
            Ok(Invocation::new(
                "tail",
                vec!["-n".to_string(), line_count(input.lines)?, input.target.path().to_string()],
            ))
        }
        ToolKind::ReadFile => {
            let input: ReadFileInput = parse(input)?;
            if !input.path.starts_with('/') {
                return Err(ToolError::InvalidInput(format!(
                    "path must be absolute, got {:?}",
                    input.path
                )));
            }
            Ok(Invocation::new(
                "head",
                vec!["-n".to_string(), line_count(input.lines)?, input.path],
            ))
        }
        ToolKind::ProcessList => {
            let input: ProcessListInput = parse(input)?;
            let limit = input.limit.unwrap_or(DEFAULT_PROCESSES);
            if limit == 0 || limit > MAX_PROCESSES {
                return Err(ToolError::InvalidInput(format!(
                    "limit must be between 1 and {}, got {}",
                    MAX_PROCESSES, limit
                )));
            }
            let sort = match input.sort_by {
                SortBy::Cpu => "--sort=-%cpu",
                SortBy::Mem => "--sort=-%mem",
            };
            let mut invocation = Invocation::new("ps", strings(&["aux", sort]));
            invocation.max_stdout_lines = Some(limit + 1);
            Ok(invocation)
        }
        ToolKind::DiskUsage => {
            let _: serde_json::Value = parse(input)?;
            Ok(Invocation::new("df", strings(&["-h", "-x", "tmpfs", "-x", "devtmpfs", "-x", "overlay"])))
        }
        ToolKind::CertificateStatus => {
            let input: CertificateStatusInput = parse(input)?;
            if !DOMAIN.is_match(&input.domain) {
                return Err(ToolError::InvalidInput(format!(
                    "domain must be a hostname like example.com, got {:?}",
                    input.domain
                )));
            }
            Ok(Invocation::new(
                "openssl",
                vec![
                    "x509".to_string(),
                    "-in".to_string(),
                    format!("/etc/letsencrypt/live/{}/cert.pem", input.domain),
                    "-noout".to_string(),
                    "-subject".to_string(),
                    "-issuer".to_string(),
                    "-enddate".to_string(),
                ],
            ))
        }
        ToolKind::BackupStatus => {
            let input: BackupStatusInput = parse(input)?;
            if !REMOTE.is_match(&input.remote) || input.remote.contains("..") {
                return Err(ToolError::InvalidInput(format!(
                    "remote must look like name:path, got {:?}",
                    input.remote
                )));
            }
            Ok(Invocation::new(
                "rclone",
                vec!["lsl".to_string(), "--max-depth".to_string(), "2".to_string(), input.remote],
            ))
        }
        ToolKind::BanStatus => {
            let input: BanStatusInput = parse(input)?;
            let mut args = vec!["status".to_string()];
            if let Some(jail) = input.jail {
                args.push(identifier("jail", &jail)?.to_string());
            }
            Ok(Invocation::new("fail2ban-client", args))
        }
        ToolKind::HttpCheck => {
            let input: HttpCheckInput = parse(input)?;
            if !is_http_url(&input.url) || input.url.chars().any(char::is_whitespace)
            {
                return Err(ToolError::InvalidInput(format!(
                    "url must be an http:// or https:// URL, got {:?}",
                    input.url
                )));
            }
            Ok(Invocation::new(
                "curl",
                vec![
                    "-sS".to_string(),
                    "-I".to_string(),
                    "--max-time".to_string(),
                    "10".to_string(),
                    input.url,
                ],
            ))
        }
        ToolKind::RunCommand => {
            let input: RunCommandInput = parse(input)?;
            let mut invocation = Invocation::new(&input.program, input.argv);
            invocation.ok_exit_codes = None;
            invocation.format = OutputFormat::Json;
            Ok(invocation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = ToolKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ToolKind::ALL.len());
    }

    #[test]
    fn test_definitions_are_objects() {
        for kind in ToolKind::ALL {
            let tool = kind.definition();
            assert_eq!(tool.tool_type, "function");
            assert_eq!(tool.function.parameters["type"], "object");
        }
    }

    #[test]
    fn test_container_logs() {
        let inv = build_invocation(
            ToolKind::ContainerLogs,
            &json!({"container": "web-1", "lines": 50}),
        )
        .unwrap();
        assert_eq!(inv.program, "docker");
        assert_eq!(inv.args, vec!["logs", "--tail", "50", "--timestamps", "web-1"]);
    }

    #[test]
    fn test_line_caps() {
        let err = build_invocation(
            ToolKind::ContainerLogs,
            &json!({"container": "web", "lines": 501}),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
        assert!(build_invocation(ToolKind::ReadLog, &json!({"target": "auth", "lines": 0})).is_err());
        let inv = build_invocation(ToolKind::ReadLog, &json!({"target": "auth"})).unwrap();
        assert_eq!(inv.args, vec!["-n", "100", "/var/log/auth.log"]);
    }

    #[test]
    fn test_identifiers_reject_flags_and_metacharacters() {
        for bad in ["-v", "web;rm", "a b", "", "$(id)"] {
            assert!(
                build_invocation(ToolKind::ServiceStatus, &json!({ "unit": bad })).is_err(),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(build_invocation(ToolKind::ServiceStatus, &json!({"unit": "nginx.service"})).is_ok());
        assert!(build_invocation(ToolKind::ServiceStatus, &json!({"unit": "getty@tty1.service"})).is_ok());
    }

    #[test]
    fn test_unknown_log_target() {
        let err = build_invocation(ToolKind::ReadLog, &json!({"target": "shadow"})).unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn test_certificate_domain() {
        let inv = build_invocation(ToolKind::CertificateStatus, &json!({"domain": "example.com"})).unwrap();
        assert_eq!(inv.args[2], "/etc/letsencrypt/live/example.com/cert.pem");
        assert!(build_invocation(ToolKind::CertificateStatus, &json!({"domain": "../../shadow"})).is_err());
        assert!(build_invocation(ToolKind::CertificateStatus, &json!({"domain": "localhost"})).is_err());
    }

    #[test]
    fn test_backup_remote() {
        assert!(build_invocation(ToolKind::BackupStatus, &json!({"remote": "b2:backups/host"})).is_ok());
        assert!(build_invocation(ToolKind::BackupStatus, &json!({"remote": "--config=/x"})).is_err());
        assert!(build_invocation(ToolKind::BackupStatus, &json!({"remote": "b2:../etc"})).is_err());
    }

    #[test]
    fn test_process_list() {
        let inv = build_invocation(ToolKind::ProcessList, &json!({"sort_by": "mem", "limit": 5})).unwrap();
        assert_eq!(inv.args, vec!["aux", "--sort=-%mem"]);
        assert_eq!(inv.max_stdout_lines, Some(6));
        assert!(build_invocation(ToolKind::ProcessList, &json!({"limit": 51})).is_err());
    }

    #[test]
    fn test_no_argument_tools_accept_null() {
        assert!(build_invocation(ToolKind::DiskUsage, &serde_json::Value::Null).is_ok());
        assert!(build_invocation(ToolKind::ContainerStatus, &json!({})).is_ok());
        assert!(build_invocation(ToolKind::BanStatus, &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn test_http_check_scheme() {
        assert!(build_invocation(ToolKind::HttpCheck, &json!({"url": "https://example.com/health"})).is_ok());
        assert!(build_invocation(ToolKind::HttpCheck, &json!({"url": "file:///etc/passwd"})).is_err());
    }

    #[test]
    fn test_http_check_agrees_with_sandbox() {
        let sandbox = crate::sandbox::Sandbox::new(crate::sandbox::SandboxPolicy::default());
        for url in ["HTTPS://example.com/health", "Http://example.com"] {
            let inv = build_invocation(ToolKind::HttpCheck, &json!({"url": url})).unwrap();
            assert!(sandbox.check(&inv.program, &inv.args).is_ok(), "{}", url);
        }
        for url in ["FILE:///etc/passwd", "https://example.com/a b"] {
            assert!(build_invocation(ToolKind::HttpCheck, &json!({"url": url})).is_err(), "{}", url);
        }
    }

    #[test]
    fn test_run_command_is_json_formatted() {
        let inv = build_invocation(
            ToolKind::RunCommand,
            &json!({"program": "free", "argv": ["-h"]}),
        )
        .unwrap();
        assert_eq!(inv.program, "free");
        assert_eq!(inv.format, OutputFormat::Json);
    }
}
