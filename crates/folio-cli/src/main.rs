mod cli;
mod config;
mod keys;
mod sessions;

use crate::cli::{ConfigCommand, SessionsCommand};
use clap::Parser;
use color_eyre::Result;
use folio_session::{CookieTransport, SessionManager, SessionRecords};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config)?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
        cli::Command::Keys(cmd) => keys::handle(cmd, &config)?,
        cli::Command::Sessions(SessionsCommand::Gc) => {
            let purged = sessions::purge_idle(&config)?;
            println!("Purged {purged} idle sessions.");
        }
        cli::Command::Mask { id } => {
            let manager = sessions::manager_from_config(&config)?;
            println!("{}", mask_id(&manager, id)?);
        }
        cli::Command::Unmask { token } => {
            let manager = sessions::manager_from_config(&config)?;
            match unmask_id(&manager, &token) {
                Some(id) => println!("{id}"),
                None => println!("not found"),
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("folio {}", env!("CARGO_PKG_VERSION"));
}

fn mask_id(manager: &SessionManager, id: u64) -> Result<String> {
    Ok(manager.mask_id(id)?)
}

fn unmask_id(manager: &SessionManager, token: &str) -> Option<u64> {
    manager.unmask_id(token)
}

/// Bootstraps the key ring and runs a two-request session cycle.
fn run_health_check(config: &config::Config) -> Result<()> {
    let manager = sessions::manager_from_config(config)?;
    let records = sessions::records_from_config(config)?;
    run_session_health(&manager, &records)?;
    println!("Keys: {} retained", manager.key_ring().len());
    println!("Sessions: ok");
    Ok(())
}

fn run_session_health(manager: &SessionManager, records: &SessionRecords) -> Result<()> {
    let probe_id = 1_000_000;
    let token = mask_id(manager, probe_id)?;
    if unmask_id(manager, &token) != Some(probe_id) {
        color_eyre::eyre::bail!("masked id round-trip failed");
    }

    let mut first = manager.session(CookieTransport::new(records.clone(), None, false));
    let csrf = first.csrf_token();
    first.commit()?;
    let cookie = first
        .transport()
        .set_cookie_headers()
        .first()
        .and_then(|header| header.split(';').next().map(str::to_string))
        .ok_or_else(|| color_eyre::eyre::eyre!("session cookie was not issued"))?;

    let mut second = manager.session(CookieTransport::new(records.clone(), Some(&cookie), false));
    let resumed = second.validate_csrf(&csrf);
    second.destroy();
    if !resumed {
        color_eyre::eyre::bail!("session did not survive a round-trip");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
