#![forbid(unsafe_code)]

use std::path::PathBuf;

use ft_conformance::{HarnessConfig, emit_device_suite_logs};
use ft_device::{DeviceBackend, DeviceEnvironment};
use serde_json::json;

fn main() -> Result<(), String> {
    let mut device = String::from("all");
    let mut output: Option<PathBuf> = None;
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--device" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--device requires one of: cpu|cuda|all".to_string())?;
                device = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_device_suites [--device cpu|cuda|all] [--output path] [--print-full-log]"
                ));
            }
        }
    }

    let backends = parse_backends(device.as_str())?;
    let env = DeviceEnvironment::detect()
        .map_err(|error| format!("failed to detect device environment: {error}"))?;
    let config = HarnessConfig::default_paths().with_env(env);

    let available = backends
        .iter()
        .filter(|backend| backend.is_available(&env))
        .count();
    if available == 0 {
        let reasons = backends
            .iter()
            .filter_map(|backend| backend.unavailable_reason(&env))
            .collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "skipped",
                "device": device,
                "reasons": reasons,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
        return Ok(());
    }

    let output_path = output.unwrap_or_else(|| config.output_path.clone());
    let summary = emit_device_suite_logs(&config, output_path.as_path(), backends.as_slice())?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated device suite log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
    } else {
        let status = if summary.exit_code() == 0 { "ok" } else { "failed" };
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": status,
                "output_path": summary.output_path.display().to_string(),
                "classes": summary.classes,
                "log_entries": summary.log_entries,
                "failed_entries": summary.failed_entries,
                "skipped_entries": summary.skipped_entries,
                "backends": summary.backends,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
    }

    if summary.failed_entries > 0 {
        return Err(format!(
            "{} device suite case(s) failed; see {}",
            summary.failed_entries,
            summary.output_path.display()
        ));
    }
    Ok(())
}

fn parse_backends(raw: &str) -> Result<Vec<DeviceBackend>, String> {
    match raw {
        "all" => Ok(DeviceBackend::all()),
        id => DeviceBackend::parse(id)
            .map(|backend| vec![backend])
            .map_err(|error| format!("unsupported device '{raw}': {error}; expected cpu|cuda|all")),
    }
}
