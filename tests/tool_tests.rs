//! Every built-in tool must produce a command line the default sandbox accepts,
//! and hostile input must be stopped before a command is built or spawned.

use serde_json::json;

use hostscope::sandbox::{Sandbox, SandboxPolicy};
use hostscope::tools::catalog::{build_invocation, ToolKind};
use hostscope::tools::{ToolRouter, UserConfig};

fn sample_input(kind: ToolKind) -> serde_json::Value {
    match kind {
        ToolKind::ContainerStatus => json!({"name": "web"}),
        ToolKind::ContainerLogs => json!({"container": "web", "lines": 50}),
        ToolKind::ServiceStatus => json!({"unit": "nginx.service"}),
        ToolKind::ReadLog => json!({"target": "auth", "lines": 20}),
        ToolKind::ReadFile => json!({"path": "/etc/hostname"}),
        ToolKind::ProcessList => json!({"sort_by": "mem", "limit": 5}),
        ToolKind::DiskUsage => json!({}),
        ToolKind::CertificateStatus => json!({"domain": "example.com"}),
        ToolKind::BackupStatus => json!({"remote": "b2:backups/daily"}),
        ToolKind::BanStatus => json!({"jail": "sshd"}),
        ToolKind::HttpCheck => json!({"url": "https://example.com/health"}),
        ToolKind::RunCommand => json!({"program": "uptime", "argv": []}),
    }
}

#[test]
fn test_every_tool_passes_default_policy() {
    let sandbox = Sandbox::new(SandboxPolicy::default());
    for kind in ToolKind::ALL.iter() {
        let invocation = build_invocation(*kind, &sample_input(*kind))
            .unwrap_or_else(|e| panic!("{} rejected sample input: {}", kind.name(), e));
        if let Err(violation) = sandbox.check(&invocation.program, &invocation.args) {
            panic!("{} built a command the sandbox rejects: {}", kind.name(), violation);
        }
    }
}

#[test]
fn test_container_list_without_name() {
    let sandbox = Sandbox::new(SandboxPolicy::default());
    let invocation = build_invocation(ToolKind::ContainerStatus, &json!({})).unwrap();
    assert_eq!(invocation.args[0], "ps");
    assert!(sandbox.check(&invocation.program, &invocation.args).is_ok());
}

#[test]
fn test_hostile_identifiers_rejected_before_build() {
    let cases = [
        (ToolKind::ContainerLogs, json!({"container": "web; rm -rf /"})),
        (ToolKind::ServiceStatus, json!({"unit": "--user"})),
        (ToolKind::CertificateStatus, json!({"domain": "../../shadow"})),
        (ToolKind::BackupStatus, json!({"remote": "b2:../secrets"})),
        (ToolKind::HttpCheck, json!({"url": "file:///etc/passwd"})),
        (ToolKind::ReadFile, json!({"path": "relative/path"})),
    ];
    for (kind, input) in cases {
        assert!(
            build_invocation(kind, &input).is_err(),
            "{} accepted {}",
            kind.name(),
            input
        );
    }
}

#[test]
fn test_sensitive_file_denied_by_sandbox() {
    let sandbox = Sandbox::new(SandboxPolicy::default());
    let invocation = build_invocation(ToolKind::ReadFile, &json!({"path": "/etc/shadow"})).unwrap();
    let violation = sandbox.check(&invocation.program, &invocation.args).unwrap_err();
    assert!(violation.to_string().contains("/etc/shadow"));
}

#[test]
fn test_catalog_respects_user_config() {
    let router = ToolRouter::new(Sandbox::new(SandboxPolicy::default()));
    let mut user = UserConfig::new("alice");
    assert_eq!(router.catalog(&user).len(), ToolKind::ALL.len());

    user.allow_run_command = false;
    let names: Vec<String> = router
        .catalog(&user)
        .into_iter()
        .map(|tool| tool.function.name)
        .collect();
    assert!(!names.iter().any(|n| n == "run_command"));
    assert!(names.iter().any(|n| n == "disk_usage"));
}

#[tokio::test]
async fn test_router_never_spawns_rejected_command() {
    let router = ToolRouter::new(Sandbox::new(SandboxPolicy::default()));
    let outcome = router
        .execute(
            "call_1",
            "run_command",
            &json!({"program": "systemctl", "argv": ["restart", "nginx"]}),
            &UserConfig::new("alice"),
        )
        .await;
    assert!(outcome.is_error);
    assert!(outcome.content.contains("restart"));
}

#[tokio::test]
async fn test_router_rejects_file_and_helper_flags() {
    let router = ToolRouter::new(Sandbox::new(SandboxPolicy::default()));
    let user = UserConfig::new("alice");
    let cases = [
        json!({"program": "openssl", "argv": ["x509", "-in", "/etc/hostname", "--out", "/etc/hostname"]}),
        json!({"program": "rclone", "argv": ["ls", "--password-command=id", "b2:backups"]}),
        json!({"program": "wc", "argv": ["--files0-from=/etc/shadow"]}),
        json!({"program": "curl", "argv": ["-w", "@/etc/shadow", "https://example.com"]}),
        json!({"program": "ls", "argv": ["-la"]}),
    ];
    for input in cases {
        let outcome = router.execute("call_1", "run_command", &input, &user).await;
        assert!(outcome.is_error, "{}", input);
        assert!(outcome.content.contains("policy violation"), "{}: {}", input, outcome.content);
    }
}
