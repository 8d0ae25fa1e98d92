use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use once_cell::sync::OnceCell;
use preflight::ProfileManager;
use preflight::cli::{print_apply_report, print_status};
use preflight::config::default_config_path;
use preflight::provider::CommandlineProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "preflight", version, about = "Startup preference-profile provisioning", long_about = None)]
struct Args {
    /// Comma-separated profile names to apply, in override order.
    #[arg(long, value_name = "NAMES")]
    profiles: Option<String>,

    /// Where the profiles are served from (file, http, or https URL).
    #[arg(long, value_name = "URL")]
    profile_location: Option<String>,

    /// KEY=VALUE pair backing `${sysprop:...}` variables (repeatable).
    #[arg(long = "property", value_name = "KEY=VALUE", action = ArgAction::Append)]
    properties: Vec<String>,

    /// Override the state directory holding the cache and the combined file.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the workspace directory searched for a .profiles marker.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Custom config path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report the provider selection and cache state instead of applying.
    #[arg(long, action = ArgAction::SetTrue)]
    status: bool,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn init_tracing(verbose: bool) {
    TRACING_INITIALIZED.get_or_init(|| {
        let default_level = if verbose {
            "preflight=debug"
        } else {
            "preflight=info"
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

fn resolve_config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

fn commandline_provider(args: &Args) -> Result<Option<CommandlineProvider>> {
    match &args.profiles {
        Some(raw) => {
            let profiles = CommandlineProvider::parse_profile_list(raw);
            let location = match &args.profile_location {
                Some(raw) => Some(
                    Url::parse(raw)
                        .with_context(|| format!("Invalid --profile-location \"{raw}\""))?,
                ),
                None => None,
            };
            Ok(Some(CommandlineProvider::new(profiles, location)))
        }
        None if args.profile_location.is_some() => {
            bail!("--profile-location requires --profiles")
        }
        None => Ok(None),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = resolve_config_path(args.config.clone())?;
    info!(path = %config_path.display(), "using preflight config");

    let mut settings = preflight::config::Settings::load_or_default(&config_path)?;
    if let Some(dir) = args.state_dir.clone() {
        settings.state_dir = Some(dir);
    }
    if let Some(dir) = args.workspace.clone() {
        settings.workspace_dir = Some(dir);
    }
    for pair in &args.properties {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --property \"{pair}\", expected KEY=VALUE"))?;
        settings.properties.insert(key.into(), value.into());
    }

    let commandline = commandline_provider(&args)?;
    let manager = ProfileManager::from_settings(settings, commandline)?;

    if args.status {
        print_status(&manager.status());
        return Ok(());
    }

    let report = manager.apply();
    print_apply_report(&report);
    Ok(())
}
