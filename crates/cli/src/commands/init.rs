//! `agentrail init`: write a default configuration file.

use agentrail_config::AppConfig;
use std::path::Path;

pub async fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");

    if write_default_config(&config_path, force)? {
        println!("✅ Created config.toml at: {}", config_path.display());
        println!("\n📝 Next steps:");
        println!("   1. Add your API key to the file, or export OPENROUTER_API_KEY");
        println!("   2. Run: agentrail run -m \"summarize this repository\"");
        println!("   3. Or start the gateway: agentrail serve\n");
    } else {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force to overwrite.");
    }

    Ok(())
}

/// Write the default config to `path`. Returns false when a file is
/// already there and `force` is not set.
pub fn write_default_config(path: &Path, force: bool) -> std::io::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    Ok(true)
}
