// src/main.rs — gentask entry point

use clap::Parser;

use gentask::cli::{admin, migrate, Cli, Commands, RulesAction, UserAction};
use gentask::core::pricing::QuantityParams;
use gentask::infra::config::Config;
use gentask::infra::{daemon, logger};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging (respects RUST_LOG / GENTASK_LOG)
    logger::init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    match cli.command {
        Commands::Serve => daemon::serve(config).await,
        Commands::Migrate { status, rollback } => migrate::run_migrate(&config, status, rollback),
        Commands::Sweep { threshold_secs } => admin::run_sweep(&config, threshold_secs).await,
        Commands::Estimate {
            capability,
            duration,
            resolution,
            mode,
            operation,
            quantity,
            characters,
        } => {
            let q = QuantityParams {
                duration_secs: duration,
                resolution,
                mode,
                operation_type: operation,
                quantity,
                character_count: characters,
            };
            admin::run_estimate(&config, &capability, q).await
        }
        Commands::Grant {
            user,
            amount,
            description,
        } => admin::run_grant(&config, &user, amount, &description).await,
        Commands::User { action } => match action {
            UserAction::Add {
                user,
                tier,
                expires,
            } => admin::run_user_add(&config, &user, &tier, expires.as_deref()).await,
            UserAction::Show { user, limit } => admin::run_user_show(&config, &user, limit).await,
        },
        Commands::Rules { action } => match action {
            RulesAction::Import { file } => admin::run_rules_import(&config, &file).await,
        },
    }
}
