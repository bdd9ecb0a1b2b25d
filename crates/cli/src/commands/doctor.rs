//! `drivetalk doctor` — Diagnose configuration and stage health.

use drivetalk_core::StageKind;
use std::path::Path;

use super::{config_path, load_config};
use crate::runtime::Runtime;

pub async fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 DriveTalk Doctor — System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    let file = config_path(path);
    if file.exists() {
        println!("  ✅ Config file found at {}", file.display());
    } else {
        println!("  ⚠️  No config file at {} — using defaults", file.display());
    }

    let config = match load_config(path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!();
            println!("  ⚠️  1 issue(s) found. See above for details.");
            return Ok(());
        }
    };

    let telemetry_enabled = config.telemetry.enabled;
    let runtime = Runtime::new(config);
    let health = runtime.scheduler().health_check().await;
    for stage in StageKind::PIPELINE {
        match health.get(&stage) {
            Some(true) => println!("  ✅ {stage} stage reachable"),
            Some(false) => {
                println!("  ❌ {stage} stage unhealthy");
                issues += 1;
            }
            None => {
                println!("  ❌ No {stage} stage registered");
                issues += 1;
            }
        }
    }

    if telemetry_enabled {
        println!("  ✅ Telemetry enabled");
    } else {
        println!("  ⚠️  Telemetry disabled — no traces will be recorded");
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
