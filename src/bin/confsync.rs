//! confsync - inspect and edit a refreshing configuration cache.

use std::{error::Error, path::Path, process};

use clap::Parser;
use confsync::{
    cli::{Cli, CliService, Command, DEFAULT_SETTINGS_FILE, formatting::format_error},
    settings::{self, Settings},
    tracing_config,
};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    tracing_config::init(&cli.log_level)?;

    if cli.command == Command::Schema {
        println!("{}", settings::schema()?);
        return Ok(());
    }

    let settings = match load_settings(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => exit_with(&e),
    };

    let coordinator = match settings.build() {
        Ok(coordinator) => coordinator,
        Err(e) => exit_with(&e),
    };

    match CliService::new(coordinator).execute(cli.command).await {
        Ok(output) if output.is_empty() => {}
        Ok(output) => println!("{output}"),
        Err(e) => exit_with(&e),
    }

    Ok(())
}

/// An explicit path must exist; the default file may be absent.
fn load_settings(path: Option<&Path>) -> confsync::Result<Settings> {
    if let Some(path) = path {
        return Settings::load(path);
    }

    let default = Path::new(DEFAULT_SETTINGS_FILE);
    if default.exists() {
        Settings::load(default)
    } else {
        debug!("No {DEFAULT_SETTINGS_FILE} found, using default settings");
        Ok(Settings::default())
    }
}

fn exit_with(error: &dyn Error) -> ! {
    eprintln!("{}: {}", format_error("Error"), error);
    process::exit(1);
}
