//! Sandbox policy: which programs may run, with which arguments
//!
//! Every diagnostic command passes through [`SandboxPolicy::validate`] before a
//! process is spawned. Validation is purely synchronous and never touches the
//! process table, so a rejected call can never have side effects.
//!
//! # Validation Order
//!
//! ```text
//! command ──► allow-list ──► forbidden chars ──► sub-verb ──► flags ──► paths / URLs
//!                │                 │                 │           │            │
//!                └──── any failure: PolicyViolation (nothing spawned) ───────┘
//! ```
//!
//! The forbidden-character scan is a first line of defense only. The property
//! that actually matters is that argv is handed to `execve` directly and never
//! reaches a shell (see `sandbox::process`).

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

lazy_static! {
    /// Shell metacharacters that have no business in a diagnostic argument.
    static ref FORBIDDEN_CHARS: Regex =
        Regex::new(r"[;|&`)\n\r\x00]|\$\(").expect("forbidden character pattern is valid");

    /// A configured rclone remote: `name:path`, no on-the-fly backends or
    /// connection-string options
    static ref REMOTE_OPERAND: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*:[^,:]*$").expect("remote operand pattern is valid");
}

/// curl switches that take no value
const FETCH_SWITCHES: &[&str] = &[
    "-s", "--silent", "-S", "--show-error", "-I", "--head", "-L", "--location", "-i",
    "--include", "-v", "--verbose", "-k", "--insecure", "-f", "--fail", "--fail-with-body",
    "-G", "--get", "-4", "--ipv4", "-6", "--ipv6", "--compressed", "--http1.1", "--http2",
    "--no-progress-meter",
];

/// curl options that take a value; `@file` values are rejected for all of them
const FETCH_VALUE_OPTIONS: &[&str] = &[
    "-H", "--header", "-A", "--user-agent", "-m", "--max-time", "--connect-timeout", "-w",
    "--write-out", "-e", "--referer", "--retry", "-r", "--range", "--resolve", "--max-redirs",
    "-X", "--request",
];

/// Directory names that hold credentials, wherever they appear in a path
const CREDENTIAL_DIRS: &[&str] = &[".ssh", ".gnupg", ".aws", ".docker", ".kube", ".password-store"];

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Why a command was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationReason {
    #[error("command not in allow-list")]
    CommandNotAllowed,

    #[error("argument {index} contains forbidden character {found:?}")]
    ForbiddenCharacter { index: usize, found: String },

    #[error("missing required sub-verb")]
    MissingSubverb,

    #[error("sub-verb '{0}' is not allowed")]
    SubverbNotAllowed(String),

    #[error("flag '{0}' is not allowed")]
    FlagNotAllowed(String),

    #[error("value {value:?} for '{flag}' is not allowed")]
    ValueNotAllowed { flag: String, value: String },

    #[error("an explicit path operand is required")]
    MissingPathOperand,

    #[error("path '{path}' is denied ({reason})")]
    PathDenied { path: String, reason: &'static str },

    #[error("path '{0}' is outside the allowed roots")]
    PathOutsideRoots(String),

    #[error("URL '{0}' must use http or https")]
    UrlNotAllowed(String),

    #[error("'{0}' is not a configured name:path remote")]
    RemoteNotAllowed(String),
}

/// A command rejected before execution
///
/// Never retried; the message is surfaced verbatim to the model and the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy violation for '{command}': {reason}")]
pub struct PolicyViolation {
    pub command: String,
    pub reason: ViolationReason,
}

impl PolicyViolation {
    fn new(command: &str, reason: ViolationReason) -> Self {
        Self {
            command: command.to_string(),
            reason,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Policy types
// ═══════════════════════════════════════════════════════════════════════════

/// Rules for one allow-listed program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRule {
    /// Read-only sub-verbs, each with an optional list of nested sub-verbs
    /// (`network` → `ls`). `None` means the program has no sub-verb.
    pub subverbs: Option<BTreeMap<String, Vec<String>>>,
    /// Filesystem argument rules, for programs that take paths
    pub paths: Option<PathRule>,
    /// When set, every flag must be one of these. Compared by name, so
    /// `--out`, `-out` and `--out=x` are the same flag.
    pub allowed_flags: Option<Vec<String>>,
    /// Flags rejected outright (`--follow`, `--vacuum-size`, ...)
    pub denied_flags: Vec<String>,
    /// Remote (`name:path`) operands, for programs like rclone
    pub remotes: Option<PathRule>,
    /// Network fetcher: only GET/HEAD over http(s), no write/upload flags
    pub network_fetch: bool,
}

/// How to find operands on a command line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathRule {
    /// Flags whose next argument is a plain value, not a path (`-n 50`)
    pub value_flags: Vec<String>,
    /// Flags whose value is a path (`-in cert.pem`, `--exclude-from=list`)
    pub path_flags: Vec<String>,
    /// The command may run with no operand at all (`openssl version`).
    /// Otherwise one is required, so the child never falls back to its
    /// working directory.
    pub optional: bool,
}

/// The full sandbox configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub commands: BTreeMap<String, CommandRule>,
    /// Paths must resolve under one of these
    pub allowed_roots: Vec<PathBuf>,
    /// Paths under any of these are always rejected
    pub denied_paths: Vec<PathBuf>,
    /// Per-call timeout
    pub timeout_ms: u64,
    /// Cap applied to stdout and stderr separately
    pub max_output_bytes: usize,
}

/// A command that passed validation, with path arguments resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            commands: default_commands(),
            allowed_roots: ["/var/log", "/etc", "/srv", "/opt", "/tmp"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            denied_paths: [
                "/etc/shadow",
                "/etc/gshadow",
                "/etc/sudoers",
                "/etc/sudoers.d",
                "/etc/ssl/private",
                "/root",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            timeout_ms: 15_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

fn subverbs(entries: &[(&str, &[&str])]) -> Option<BTreeMap<String, Vec<String>>> {
    Some(
        entries
            .iter()
            .map(|(verb, nested)| {
                (
                    verb.to_string(),
                    nested.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect(),
    )
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_commands() -> BTreeMap<String, CommandRule> {
    let mut commands = BTreeMap::new();

    // ─────────────────────────────────────────────────────────────────
    // Multiplexing CLIs - only read-only sub-verbs
    // ─────────────────────────────────────────────────────────────────
    commands.insert(
        "docker".to_string(),
        CommandRule {
            subverbs: subverbs(&[
                ("ps", &[]),
                ("inspect", &[]),
                ("logs", &[]),
                ("images", &[]),
                ("version", &[]),
                ("info", &[]),
                ("stats", &[]),
                ("top", &[]),
                ("network", &["ls", "inspect"]),
                ("volume", &["ls", "inspect"]),
            ]),
            // Remote daemons over ssh, alternate client config
            denied_flags: strings(&["-H", "--host", "-c", "--context", "--config"]),
            ..Default::default()
        },
    );
    commands.insert(
        "systemctl".to_string(),
        CommandRule {
            subverbs: subverbs(&[
                ("status", &[]),
                ("is-active", &[]),
                ("is-enabled", &[]),
                ("is-failed", &[]),
                ("list-units", &[]),
                ("list-timers", &[]),
                ("show", &[]),
            ]),
            denied_flags: strings(&["-H", "--host", "--root", "--image"]),
            ..Default::default()
        },
    );
    // rclone can run helper programs (--sftp-ssh, --password-command) and
    // read arbitrary config, so only listing flags are accepted
    commands.insert(
        "rclone".to_string(),
        CommandRule {
            subverbs: subverbs(&[
                ("ls", &[]),
                ("lsd", &[]),
                ("lsl", &[]),
                ("size", &[]),
                ("about", &[]),
                ("version", &[]),
            ]),
            allowed_flags: Some(strings(&[
                "--max-depth",
                "--human-readable",
                "--json",
                "-R",
                "--recursive",
                "-q",
                "--quiet",
            ])),
            remotes: Some(PathRule {
                value_flags: strings(&["--max-depth"]),
                path_flags: vec![],
                optional: true,
            }),
            ..Default::default()
        },
    );
    commands.insert(
        "fail2ban-client".to_string(),
        CommandRule {
            subverbs: subverbs(&[("status", &[]), ("ping", &[]), ("version", &[])]),
            ..Default::default()
        },
    );
    // OpenSSL 3 takes `--opt` as well as `-opt`; flags are matched by name
    commands.insert(
        "openssl".to_string(),
        CommandRule {
            subverbs: subverbs(&[("x509", &[]), ("version", &[])]),
            allowed_flags: Some(strings(&[
                "-in",
                "-inform",
                "-noout",
                "-subject",
                "-issuer",
                "-enddate",
                "-startdate",
                "-dates",
                "-serial",
                "-fingerprint",
                "-sha1",
                "-sha256",
                "-hash",
                "-text",
                "-ext",
                "-checkend",
                "-nameopt",
                "-dateopt",
            ])),
            paths: Some(PathRule {
                value_flags: strings(&["-inform", "-nameopt", "-dateopt", "-ext", "-checkend"]),
                path_flags: strings(&["-in"]),
                optional: true,
            }),
            ..Default::default()
        },
    );

    // ─────────────────────────────────────────────────────────────────
    // Log access - journald has write operations hidden behind flags
    // ─────────────────────────────────────────────────────────────────
    commands.insert(
        "journalctl".to_string(),
        CommandRule {
            denied_flags: strings(&[
                "-f",
                "--follow",
                "--vacuum-size",
                "--vacuum-time",
                "--vacuum-files",
                "--rotate",
                "--flush",
                "--sync",
                "--relinquish-var",
                "--smart-relinquish-var",
                "--setup-keys",
                "--update-catalog",
                "--cursor-file",
                "-D",
                "--directory",
                "--file",
                "--root",
                "--image",
            ]),
            ..Default::default()
        },
    );

    // ─────────────────────────────────────────────────────────────────
    // Plain status commands
    // ─────────────────────────────────────────────────────────────────
    for name in ["ps", "df", "free", "uptime", "uname", "hostname", "ss"] {
        commands.insert(name.to_string(), CommandRule::default());
    }

    // ─────────────────────────────────────────────────────────────────
    // File readers - path rules apply
    // ─────────────────────────────────────────────────────────────────
    let line_flags = PathRule {
        value_flags: strings(&["-n", "-c", "--lines", "--bytes"]),
        ..Default::default()
    };
    for name in ["head", "tail"] {
        commands.insert(
            name.to_string(),
            CommandRule {
                paths: Some(line_flags.clone()),
                denied_flags: strings(&["-f", "-F", "--follow", "--retry"]),
                ..Default::default()
            },
        );
    }
    for name in ["ls", "cat", "stat"] {
        commands.insert(
            name.to_string(),
            CommandRule {
                paths: Some(PathRule::default()),
                ..Default::default()
            },
        );
    }
    // --files0-from reads a list of names from a file that is never checked
    commands.insert(
        "wc".to_string(),
        CommandRule {
            paths: Some(PathRule::default()),
            denied_flags: strings(&["--files0-from"]),
            ..Default::default()
        },
    );
    commands.insert(
        "du".to_string(),
        CommandRule {
            paths: Some(PathRule {
                value_flags: strings(&["-d", "--max-depth"]),
                path_flags: strings(&["-X", "--exclude-from"]),
                ..Default::default()
            }),
            denied_flags: strings(&["--files0-from"]),
            ..Default::default()
        },
    );

    commands.insert(
        "curl".to_string(),
        CommandRule {
            paths: None,
            network_fetch: true,
            ..Default::default()
        },
    );

    commands
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════

impl SandboxPolicy {
    /// Check whether a program is on the allow-list at all
    pub fn is_allowed(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Validate a command line, returning the argv to execute
    ///
    /// Path arguments in the returned argv are replaced by their resolved
    /// form, so the process opens exactly the file that was checked.
    pub fn validate(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ValidatedCommand, PolicyViolation> {
        let violation = |reason| PolicyViolation::new(command, reason);

        // 1. Allow-list
        let rule = self
            .commands
            .get(command)
            .ok_or_else(|| violation(ViolationReason::CommandNotAllowed))?;

        // 2. Forbidden characters, anywhere in any argument
        for (index, arg) in args.iter().enumerate() {
            if let Some(found) = FORBIDDEN_CHARS.find(arg) {
                return Err(violation(ViolationReason::ForbiddenCharacter {
                    index,
                    found: found.as_str().to_string(),
                }));
            }
        }

        // 3. Sub-verbs
        let operands_start = match &rule.subverbs {
            Some(allowed) => check_subverbs(allowed, args).map_err(violation)?,
            None => 0,
        };

        // 4. Flags
        for arg in args.iter().filter(|arg| is_flag(arg)) {
            if let Some(allowed) = &rule.allowed_flags {
                if matching_flag(arg, allowed).is_none() {
                    return Err(violation(ViolationReason::FlagNotAllowed(
                        flag_text(arg).to_string(),
                    )));
                }
            }
            let denied = matching_flag(arg, &rule.denied_flags)
                .or_else(|| bundled_flag(arg, &rule.denied_flags));
            if let Some(flag) = denied {
                return Err(violation(ViolationReason::FlagNotAllowed(flag.to_string())));
            }
        }

        let mut validated = args.to_vec();

        // 5. Paths
        if let Some(path_rule) = &rule.paths {
            let found = operands(path_rule, args, operands_start).map_err(violation)?;
            if found.is_empty() && !path_rule.optional {
                return Err(violation(ViolationReason::MissingPathOperand));
            }
            for operand in found {
                let resolved = self.resolve_path(operand.value).map_err(violation)?;
                validated[operand.index] =
                    format!("{}{}", operand.prefix, resolved.to_string_lossy());
            }
        }

        // 6. Remotes
        if let Some(remote_rule) = &rule.remotes {
            for operand in operands(remote_rule, args, operands_start).map_err(violation)? {
                if !REMOTE_OPERAND.is_match(operand.value) || operand.value.contains("..") {
                    return Err(violation(ViolationReason::RemoteNotAllowed(
                        operand.value.to_string(),
                    )));
                }
            }
        }

        // 7. Network fetch
        if rule.network_fetch {
            check_fetch_args(args).map_err(violation)?;
        }

        Ok(ValidatedCommand {
            program: command.to_string(),
            args: validated,
        })
    }

    /// Resolve a path argument and check it against roots and denylist
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ViolationReason> {
        let requested = Path::new(raw);
        if !requested.is_absolute() {
            return Err(ViolationReason::PathDenied {
                path: raw.to_string(),
                reason: "relative paths are not allowed",
            });
        }

        let lexical = normalize(requested);
        // Follow symlinks when the target exists so a link cannot escape the roots
        let resolved = std::fs::canonicalize(&lexical).unwrap_or_else(|_| lexical.clone());

        for candidate in [&lexical, &resolved] {
            if let Some(reason) = self.denied_reason(candidate) {
                return Err(ViolationReason::PathDenied {
                    path: candidate.to_string_lossy().into_owned(),
                    reason,
                });
            }
        }

        if !self
            .allowed_roots
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            return Err(ViolationReason::PathOutsideRoots(
                resolved.to_string_lossy().into_owned(),
            ));
        }

        Ok(resolved)
    }

    fn denied_reason(&self, path: &Path) -> Option<&'static str> {
        if self.denied_paths.iter().any(|denied| path.starts_with(denied)) {
            return Some("sensitive location");
        }

        for component in path.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if CREDENTIAL_DIRS.contains(&name.as_ref()) {
                    return Some("credential directory");
                }
            }
        }

        let file_name = path.file_name()?.to_string_lossy();
        if file_name == ".env" || file_name.starts_with(".env.") {
            return Some("environment file");
        }
        if file_name.ends_with("_history") || file_name == ".history" || file_name == ".histfile" {
            return Some("shell history");
        }
        if file_name.starts_with("privkey") || file_name.ends_with(".key") {
            return Some("private key");
        }
        None
    }
}

/// Check the first (and, if required, second) positional argument against the
/// sub-verb allow-list. Returns the index where operands begin.
fn check_subverbs(
    allowed: &BTreeMap<String, Vec<String>>,
    args: &[String],
) -> Result<usize, ViolationReason> {
    let (index, verb) = next_positional(args, 0).ok_or(ViolationReason::MissingSubverb)?;
    let nested = allowed
        .get(verb)
        .ok_or_else(|| ViolationReason::SubverbNotAllowed(verb.to_string()))?;

    if nested.is_empty() {
        return Ok(index + 1);
    }

    let (nested_index, nested_verb) =
        next_positional(args, index + 1).ok_or(ViolationReason::MissingSubverb)?;
    if !nested.iter().any(|n| n == nested_verb) {
        return Err(ViolationReason::SubverbNotAllowed(format!(
            "{} {}",
            verb, nested_verb
        )));
    }
    Ok(nested_index + 1)
}

fn next_positional(args: &[String], from: usize) -> Option<(usize, &str)> {
    args.iter()
        .enumerate()
        .skip(from)
        .find(|(_, arg)| !arg.starts_with('-'))
        .map(|(i, arg)| (i, arg.as_str()))
}

/// True for `-x`, `-abc`, `--long` and `--long=value`; not for `-` or `--`
fn is_flag(arg: &str) -> bool {
    arg.len() > 1 && arg.starts_with('-') && arg != "--"
}

/// The flag part of `--flag=value`
fn flag_text(arg: &str) -> &str {
    arg.split_once('=').map(|(name, _)| name).unwrap_or(arg)
}

/// `--out=x`, `--out` and `-out` all name `out`
fn flag_name(arg: &str) -> &str {
    flag_text(arg).trim_start_matches('-')
}

/// Match a flag against a flag list by name, whatever its dash prefix
fn matching_flag<'a, S: AsRef<str>>(arg: &str, flags: &'a [S]) -> Option<&'a str> {
    if !is_flag(arg) {
        return None;
    }
    let name = flag_name(arg);
    flags.iter().map(AsRef::as_ref).find(|f| flag_name(f) == name)
}

/// Single-letter flags from the list hidden in a bundle (`-fn5`)
fn bundled_flag<'a, S: AsRef<str>>(arg: &str, flags: &'a [S]) -> Option<&'a str> {
    let bundle = arg.strip_prefix('-').filter(|b| b.len() > 1 && !b.starts_with('-'))?;
    flags.iter().map(AsRef::as_ref).find(|flag| {
        let mut letters = flag.strip_prefix('-').unwrap_or("").chars();
        match (letters.next(), letters.next()) {
            (Some(letter), None) if letter != '-' => bundle.contains(letter),
            _ => false,
        }
    })
}

/// An operand on the command line: a whole argument, or the value of a
/// path-taking flag written as `--flag=value` or `-Xvalue`
#[derive(Debug)]
struct Operand<'a> {
    index: usize,
    prefix: &'a str,
    value: &'a str,
}

/// Locate operands after `start`. A flag that embeds a path the rule does
/// not know how to check is rejected rather than skipped.
fn operands<'a>(
    rule: &PathRule,
    args: &'a [String],
    start: usize,
) -> Result<Vec<Operand<'a>>, ViolationReason> {
    let whole = move |index: usize| Operand {
        index,
        prefix: "",
        value: args[index].as_str(),
    };
    let mut found = Vec::new();
    let mut i = start;
    let mut only_operands = false;

    while i < args.len() {
        let arg = args[i].as_str();
        if !only_operands && arg == "--" {
            only_operands = true;
        } else if only_operands || !is_flag(arg) {
            if arg != "-" {
                found.push(whole(i));
            }
        } else if let Some((name, value)) = arg.split_once('=') {
            if matching_flag(name, &rule.path_flags).is_some() {
                found.push(Operand {
                    index: i,
                    prefix: &arg[..name.len() + 1],
                    value,
                });
            } else if value.contains('/') {
                return Err(ViolationReason::FlagNotAllowed(name.to_string()));
            }
        } else if matching_flag(arg, &rule.path_flags).is_some() {
            if i + 1 < args.len() {
                found.push(whole(i + 1));
            }
            i += 1;
        } else if matching_flag(arg, &rule.value_flags).is_some() {
            i += 1;
        } else if let Some(flag) = rule
            .path_flags
            .iter()
            .find(|f| is_short_flag(f) && arg.len() > 2 && arg.starts_with(f.as_str()))
        {
            found.push(Operand {
                index: i,
                prefix: &arg[..flag.len()],
                value: &arg[flag.len()..],
            });
        } else if arg.contains('/') {
            return Err(ViolationReason::FlagNotAllowed(arg.to_string()));
        }
        i += 1;
    }
    Ok(found)
}

fn is_short_flag(flag: &str) -> bool {
    flag.len() == 2 && flag.starts_with('-') && flag != "--"
}

/// http(s) URL, scheme matched case-insensitively like curl does
pub fn is_http_url(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

/// curl accepts only known read-only options and http(s) URLs
fn check_fetch_args(args: &[String]) -> Result<(), ViolationReason> {
    let mut args = args.iter().map(String::as_str);
    let mut urls_only = false;

    while let Some(arg) = args.next() {
        if !urls_only && arg == "--" {
            urls_only = true;
        } else if urls_only || !is_flag(arg) {
            if !is_http_url(arg) {
                return Err(ViolationReason::UrlNotAllowed(arg.to_string()));
            }
        } else if arg.starts_with("--") {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (arg, None),
            };
            if inline.is_none() && FETCH_SWITCHES.contains(&flag) {
                continue;
            }
            if !FETCH_VALUE_OPTIONS.contains(&flag) {
                return Err(ViolationReason::FlagNotAllowed(flag.to_string()));
            }
            let value = match inline {
                Some(value) => value,
                None => args.next().unwrap_or(""),
            };
            check_fetch_value(flag, value)?;
        } else {
            // Bundled short options: -sSL, -sXPOST, -w@file
            let bundle = &arg[1..];
            for (pos, ch) in bundle.char_indices() {
                let flag = format!("-{}", ch);
                if FETCH_SWITCHES.contains(&flag.as_str()) {
                    continue;
                }
                if !FETCH_VALUE_OPTIONS.contains(&flag.as_str()) {
                    return Err(ViolationReason::FlagNotAllowed(flag));
                }
                let inline = &bundle[pos + ch.len_utf8()..];
                let value = if inline.is_empty() {
                    args.next().unwrap_or("")
                } else {
                    inline
                };
                check_fetch_value(&flag, value)?;
                break;
            }
        }
    }
    Ok(())
}

/// `@file` reads a local file into the value, `%output{}` writes one
fn check_fetch_value(flag: &str, value: &str) -> Result<(), ViolationReason> {
    if value.starts_with('@') || value.contains("%output{") {
        return Err(ViolationReason::ValueNotAllowed {
            flag: flag.to_string(),
            value: value.to_string(),
        });
    }
    match flag {
        "-X" | "--request" => check_method(flag, value),
        _ => Ok(()),
    }
}

fn check_method(flag: &str, method: &str) -> Result<(), ViolationReason> {
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" => Ok(()),
        _ => Err(ViolationReason::FlagNotAllowed(format!("{} {}", flag, method))),
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
