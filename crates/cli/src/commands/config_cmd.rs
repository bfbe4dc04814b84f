//! `agentrail config`: inspect the effective configuration.

use agentrail_config::AppConfig;

const REDACTED: &str = "***REDACTED***";

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", render_redacted(&config)?);
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
    Ok(())
}

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let mut warnings = Vec::new();
    if !config.has_api_key() && config.providers.values().all(|p| p.api_key.is_none()) {
        warnings.push("No API key set (set OPENROUTER_API_KEY or OPENAI_API_KEY env var)".to_string());
    }
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway bound to 0.0.0.0; the control API has no authentication".to_string());
    }
    if config.tools.allowed_commands.is_empty() {
        warnings.push("tools.allowed_commands is empty: the shell tool may run any command".to_string());
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
    println!("   Provider:  {}", config.default_provider);
    println!("   Model:     {}", config.default_model);
    println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", config.store.backend);
    println!("   Max iter:  {}", config.agent.max_iterations);

    Ok(())
}

/// The config as TOML with every secret-looking string replaced.
pub fn render_redacted(config: &AppConfig) -> Result<String, Box<dyn std::error::Error>> {
    let mut value = toml::Value::try_from(config)?;
    redact_secrets(&mut value);
    Ok(toml::to_string_pretty(&value)?)
}

fn redact_secrets(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, val) in table.iter_mut() {
                let key_lower = key.to_lowercase();
                let secret_key = ["key", "secret", "token", "password"]
                    .iter()
                    .any(|needle| key_lower.contains(needle));
                match val {
                    toml::Value::String(s) if secret_key && !s.is_empty() => *s = REDACTED.into(),
                    _ => redact_secrets(val),
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}
