use std::path::Path;

use {anyhow::Result, clap::Subcommand, tradeclaw_config::TradeclawConfig};

const REDACTED: &str = "<redacted>";

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML, with tokens redacted.
    Show,
    /// Load and validate the configuration, then exit.
    Check,
    /// Print the config and data directories.
    Path,
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = tradeclaw_config::discover_and_load(explicit)?;
            print!("{}", render(config)?);
            Ok(())
        },
        ConfigAction::Check => {
            let config = tradeclaw_config::discover_and_load(explicit)?;
            config.validate()?;
            println!(
                "config ok: {}:{}, transcripts {:?}",
                config.gateway.bind, config.gateway.port, config.sessions.transcript
            );
            Ok(())
        },
        ConfigAction::Path => {
            match tradeclaw_config::config_dir() {
                Some(dir) => println!("config: {}", dir.display()),
                None => println!("config: (no home directory)"),
            }
            println!("data:   {}", tradeclaw_config::data_dir().display());
            Ok(())
        },
    }
}

fn render(mut config: TradeclawConfig) -> Result<String> {
    if config.gateway.token.is_some() {
        config.gateway.token = Some(REDACTED.into());
    }
    for entry in &mut config.gateway.tokens {
        entry.token = REDACTED.into();
    }
    Ok(toml::to_string_pretty(&config)?)
}
