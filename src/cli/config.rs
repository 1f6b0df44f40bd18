//! `init-config` and `check-config`
//!
//! The default config lives at `<config dir>/subgate/config.toml`
//! (`~/.config/subgate/config.toml` on Linux).

use std::path::PathBuf;
use subgate::config::GateConfig;
use subgate::platform::GuildId;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("subgate")
        .join("config.toml")
}

/// Explicit path, or the default location
pub fn resolve_path(path: Option<String>) -> PathBuf {
    path.map(PathBuf::from).unwrap_or_else(default_config_path)
}

pub fn init(
    guild: u64,
    path: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = resolve_path(path);
    if path.exists() && !force {
        return Err(format!(
            "config file {} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    GateConfig::create_default(&path, GuildId(guild))?;
    println!("Wrote default configuration to {}", path.display());
    println!("Set [roles] paid and free before starting the gate.");
    Ok(())
}

pub fn check(path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let path = resolve_path(path);
    let config = GateConfig::load(&path)?;
    let entitlements = config.roles.entitlements(config.guild.id)?;

    println!("Configuration OK: {}", path.display());
    println!();
    println!("  Guild:        {}", config.guild.id);
    println!("  Paid role:    {}", entitlements.paid);
    println!("  Free role:    {}", entitlements.free);
    if !config.roles.bypass.is_empty() {
        let bypass: Vec<String> = config.roles.bypass.iter().map(|r| r.to_string()).collect();
        println!("  Bypass roles: {}", bypass.join(", "));
    }
    println!();

    let timing = &config.timing;
    println!("  Join grace:       {}", humantime::format_duration(timing.join_grace));
    println!("  Release debounce: {}", humantime::format_duration(timing.release_debounce));
    println!(
        "  Confirmation:     {} attempts, {} apart",
        timing.confirm_attempts,
        humantime::format_duration(timing.confirm_interval)
    );
    println!(
        "  Drift watch:      {} every {}",
        humantime::format_duration(timing.drift_watch),
        humantime::format_duration(timing.drift_interval)
    );
    Ok(())
}
