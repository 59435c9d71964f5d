use clap::Parser;

use udb::api;
use udb::config::{Args, Config};
use udb::error::Result;
use udb::App;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let is_help = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            // Exit code 2 signals an argument parse failure.
            std::process::exit(if is_help { 0 } else { 2 });
        }
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("udb: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config) {
        tracing::error!("startup failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let default = Config::default_path()?;
            if default.exists() {
                Config::load(&default)?
            } else {
                Config::from_env()?
            }
        }
    };
    config.merge_args(args);
    Ok(config)
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    fmt().with_env_filter(filter).with_target(false).init();
}

/// Boot the application container and report store status. Request dispatch
/// is owned by the external front end; this binary verifies the database,
/// seeds the builtin rules and the admin account, and prints the inventory.
fn run(config: Config) -> Result<()> {
    let app = App::bootstrap(config)?;

    println!("Database ready at {}", app.config.db_path().display());
    let summary = api::dashboard(&app.store)?;
    println!("\nInventory:");
    for (kind, count) in &summary.counts {
        println!("  {:<12} {}", kind, count);
    }

    let outcomes = app.evaluate_rules()?;
    let open: usize = outcomes.iter().map(|o| o.violations).sum();
    let skipped = outcomes.iter().filter(|o| o.skipped).count();
    println!("\nRules: {} evaluated, {} open violation(s)", outcomes.len(), open);
    if skipped > 0 {
        println!("  {} rule(s) skipped (timeout)", skipped);
    }

    Ok(())
}
