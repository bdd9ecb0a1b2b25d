//! `drivetalk config` — Configuration management commands.

use drivetalk_config::AppConfig;
use drivetalk_core::{Priority, StageKind};
use std::path::Path;

use super::{config_path, load_config};

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration at {}...", config_path(path).display());

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    // Legal but likely unintended settings
    let mut warnings = Vec::new();
    let budgets = &config.scheduler.latency_budgets;
    if !(budgets.critical_ms <= budgets.high_ms
        && budgets.high_ms <= budgets.normal_ms
        && budgets.normal_ms <= budgets.low_ms)
    {
        warnings.push("Latency budgets are not tighter for higher priorities".to_string());
    }
    if config.allocator.latency_threshold_ms > budgets.normal_ms {
        warnings.push(format!(
            "allocator.latency_threshold_ms ({}) exceeds the normal turn budget ({}ms)",
            config.allocator.latency_threshold_ms, budgets.normal_ms
        ));
    }
    if config.scheduler.fallback_timeout_ms > config.scheduler.cancel_grace_ms * 10 {
        warnings.push("Fallback timeout is much longer than the cancel grace period".to_string());
    }
    if config.fusion.auto_open_sessions {
        warnings.push("Sessions are opened implicitly by any source".to_string());
    }

    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    for stage in StageKind::PIPELINE {
        println!(
            "   {:<14} {} slot(s)",
            stage.to_string(),
            config.allocator.stages.for_stage(stage)
        );
    }
    for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
        println!(
            "   {:<14} {}ms budget",
            priority.to_string(),
            budgets.for_priority(priority)
        );
    }
    println!("   Queue:         {} deltas", config.ingest.queue_capacity);
    println!("   Idle timeout:  {}s", config.sessions.idle_timeout_secs);

    Ok(())
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// Print the built-in defaults as a starting config file.
pub async fn defaults() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::default_toml());
    Ok(())
}

pub async fn path(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path(path).display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = config_path(None);
        assert!(path.to_str().unwrap().contains("config.toml"));
        assert_eq!(config_path(Some(Path::new("/etc/dt.toml"))), Path::new("/etc/dt.toml"));
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "[sessions]\nhistory_limit = 4\n").unwrap();
        let config = load_config(Some(&file)).unwrap();
        assert_eq!(config.sessions.history_limit, 4);
    }
}
