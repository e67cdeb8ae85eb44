//! botstrap - main entry point

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use botstrap::cli::{Cli, Commands};
use botstrap::command_runner::SystemRunner;
use botstrap::plan::{self, Plan};
use botstrap::{Engine, EnvSnapshot, ProvisionConfig, process_guard, reporter};

/// Log to stderr so stdout carries only the report. `RUST_LOG` overrides
/// the default `info` level.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<ProvisionConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ProvisionConfig::load_from_file(path)?
        }
        None => {
            info!("Using built-in profile {}", cli.profile);
            cli.profile.config()
        }
    };
    config.validate().context("Configuration is invalid")?;
    Ok(config)
}

/// Execute the plan and return the process exit code
fn run(cli: &Cli, config: &ProvisionConfig) -> Result<i32> {
    let plan = Plan::from_config(config)?;
    let runner = SystemRunner::new();
    let env = EnvSnapshot::capture(&config.extra_path_dirs);

    let mut engine = Engine::new(&runner, env).with_dry_run(cli.dry_run);
    let report = engine.run(&plan)?;

    if cli.json {
        println!("{}", reporter::render_json(&report)?);
    } else {
        print!("{}", reporter::render(&report));
    }
    Ok(report.exit_code())
}

fn dispatch(cli: &Cli) -> Result<i32> {
    match cli.command() {
        Commands::Validate { file } => {
            info!("Validating configuration file: {:?}", file);
            let config = ProvisionConfig::load_from_file(file)?;
            config.validate()?;
            let plan = Plan::from_config(&config)?;
            println!("✓ Configuration file is valid ({} steps)", plan.len());
            Ok(0)
        }
        Commands::Init { file, force } => {
            info!("Writing profile {} to {:?}", cli.profile, file);
            cli.profile.config().init_file(file, *force)?;
            println!("✓ Wrote {} profile to {}", cli.profile, file.display());
            Ok(0)
        }
        Commands::Plan => {
            let config = load_config(cli)?;
            print!("{}", plan::describe(&Plan::from_config(&config)?));
            Ok(0)
        }
        Commands::Unit => {
            let config = load_config(cli)?;
            let service = config
                .service
                .context("Configuration has no service section")?;
            print!("{}", service.unit.render());
            Ok(0)
        }
        Commands::Run => {
            let config = load_config(cli)?;
            run(cli, &config)
        }
    }
}

fn main() {
    init_logger();

    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();
    debug!(?cli, "CLI arguments parsed");

    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
