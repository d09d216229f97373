use anyhow::{Result, bail};
use rnetcfg::config::SessionConfig;
use rnetcfg::device::{CommitOptions, ConfigFormat, Credentials, DeviceTarget, LoadOptions};
use rnetcfg::session::{AuditLevel, OperationFacade, OperationResult, SessionRegistry};
use rnetcfg::simulator::SimulatedDevice;
use std::sync::Arc;

fn print_result(step: &str, result: &OperationResult) {
    println!(
        "{step}: success={} message={}",
        result.success, result.message
    );
    if let Some(payload) = &result.payload {
        println!("  payload={payload}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let fail_check = std::env::args().any(|arg| arg == "--fail-check");

    // An in-memory device stands in for a real transport.
    let device = SimulatedDevice::with_active_config(&[
        "set system host-name edge-1",
        "set interfaces ge-0/0/0 unit 0 family inet address 10.0.0.1/30",
    ]);
    if fail_check {
        device.set_commit_check(false);
    }

    let config = SessionConfig {
        audit_level: AuditLevel::Full,
        ..SessionConfig::default()
    };
    let registry = Arc::new(SessionRegistry::new(Arc::new(device.connector()), config));
    let facade = OperationFacade::new(
        registry.clone(),
        DeviceTarget::new("192.168.1.1", Credentials::password("admin", "password")),
    );

    print_result("facts", &facade.facts().await);

    // 1) Stage the change without committing and review the diff.
    let staged = LoadOptions {
        format: Some(ConfigFormat::Set),
        commit: false,
        ..LoadOptions::default()
    };
    let result = facade
        .load_config(
            "set system host-name edge-2\nset system ntp server 10.0.0.254",
            &staged,
        )
        .await;
    print_result("load", &result);
    print_result("diff", &facade.diff().await);

    // 2) Commit with a comment. A failed pre-commit check never reaches the device.
    let result = facade
        .commit_with(&CommitOptions {
            comment: Some("rename edge-1".to_string()),
            ..CommitOptions::default()
        })
        .await;
    print_result("commit", &result);

    if let Some(recorder) = registry.recorder() {
        println!("audit trail:");
        println!("{}", recorder.to_jsonl()?);
    }

    print_result("close", &facade.close().await);
    if !result.success {
        bail!("configuration push failed: {}", result.message);
    }
    Ok(())
}
