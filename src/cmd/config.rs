//! Configuration view and validation — `crew config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use crew::config::{CREW_DIR, Config};
    use crew::crew_config::{CONFIG_FILE, CrewToml};

    let config_path = project_dir.join(CREW_DIR).join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Crew Configuration");
            println!("==================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No crew.toml found at {}", config_path.display());
                println!("Using defaults. Run 'crew init' to create one.");
            }
            println!();

            // Effective values include environment overrides.
            let toml = if config_path.exists() {
                Config::load(project_dir)?.toml
            } else {
                let mut toml = CrewToml::default();
                toml.apply_env();
                toml
            };
            print!("{}", toml::to_string_pretty(&toml)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No crew.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = CrewToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
