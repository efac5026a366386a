//! `moduledepot` - command-line front end for the module manager.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use moduledepot_core::license::{LicenseStatus, Verification};
use moduledepot_core::logging::init_logging;
use moduledepot_core::{ManagerConfig, ModuleManager, OperationReport, UpdateSource};

#[derive(Parser)]
#[command(name = "moduledepot", version, about = "Install and manage application modules")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Application root that relative paths are resolved against
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create directories, the registry and the license store
    Init,
    /// List installed modules
    List,
    /// Install a module from a local zip package
    Install {
        /// Path to the package
        archive: PathBuf,
    },
    /// Download and install a module package
    InstallUrl {
        url: String,
        /// Bearer token sent with the download
        #[arg(long)]
        token: Option<String>,
    },
    /// Verify a purchase code and install the purchased module
    InstallPurchase { purchase_code: String },
    /// Enable an installed module
    Enable { module: String },
    /// Disable an installed module
    Disable { module: String },
    /// Remove a module and its published assets
    Uninstall { module: String },
    /// Update a module to the newest available version
    Update { module: String },
    /// Show available updates
    CheckUpdates,
    /// Show the marketplace listing
    Marketplace,
    /// Verify a single purchase code
    VerifyPurchase { purchase_code: String },
    /// List purchases made with the configured Envato account
    Purchases,
    /// Search the Envato catalog
    Search {
        term: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Re-verify every stored license
    VerifyLicenses,
    /// Reconcile the registry with the modules directory
    Sync,
    /// Periodic work: update check and due license verification
    Scheduled,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ManagerConfig::load(cli.config.as_deref(), cli.base_dir.as_deref())?;
    let manager = ModuleManager::from_config(config)?;

    match cli.command {
        Commands::Init => {
            manager.initialize()?;
            let config = manager.config();
            println!("Initialized module manager in {}", config.base_dir.display());
            println!("  modules:  {}", config.modules_dir().display());
            println!("  registry: {}", config.registry_path().display());
            println!("  licenses: {}", config.licenses_path().display());
        }
        Commands::List => {
            let modules = manager.list()?;
            if modules.is_empty() {
                println!("No modules installed");
            }
            for module in modules {
                let state = if module.enabled { "enabled" } else { "disabled" };
                println!("{:<24} {:<12} {}", module.name(), module.version(), state);
            }
        }
        Commands::Install { archive } => print_report(manager.install(&archive)?),
        Commands::InstallUrl { url, token } => {
            print_report(manager.install_from_url(&url, token.as_deref())?)
        }
        Commands::InstallPurchase { purchase_code } => {
            print_report(manager.install_purchased(&purchase_code)?)
        }
        Commands::Enable { module } => print_report(manager.enable(&module)?),
        Commands::Disable { module } => print_report(manager.disable(&module)?),
        Commands::Uninstall { module } => print_report(manager.uninstall(&module)?),
        Commands::Update { module } => print_report(manager.update(&module)?),
        Commands::CheckUpdates => print_updates(&manager)?,
        Commands::Marketplace => {
            let modules = manager.available_modules();
            if modules.is_empty() {
                println!("No modules available");
            }
            for module in modules {
                println!("{:<24} {:<12} {}", module.name, module.version, module.description);
            }
        }
        Commands::VerifyPurchase { purchase_code } => match manager.verify_purchase(&purchase_code)? {
            Verification::Valid(record) => println!(
                "License for {} is valid until {}",
                record.module, record.valid_until
            ),
            Verification::Invalid { reason } => anyhow::bail!(reason),
        },
        Commands::Purchases => print_json(&manager.purchases()?)?,
        Commands::Search { term, category } => {
            print_json(&manager.search_catalog(&term, category.as_deref())?)?
        }
        Commands::VerifyLicenses => print_license_statuses(&manager)?,
        Commands::Sync => {
            let changes = manager.sync()?;
            if changes.is_empty() {
                println!("Registry is up to date");
            }
            for name in changes.added {
                println!("Registered {}", name);
            }
            for name in changes.removed {
                println!("Removed stale entry {}", name);
            }
        }
        Commands::Scheduled => {
            if manager.config().enable_auto_updates {
                print_updates(&manager)?;
            }
            if manager.licenses_due()? {
                print_license_statuses(&manager)?;
            }
        }
    }

    Ok(())
}

fn print_report(report: OperationReport) {
    println!("{}", report.message);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_updates(manager: &ModuleManager) -> anyhow::Result<()> {
    let updates = manager.check_for_updates()?;
    if updates.is_empty() {
        println!("All modules are up to date");
    }
    for (name, info) in updates {
        let source = match info.source {
            UpdateSource::Marketplace { .. } => "marketplace",
            UpdateSource::Purchase { .. } => "purchase",
        };
        println!(
            "{:<24} {} -> {} ({})",
            name, info.current_version, info.new_version, source
        );
    }
    Ok(())
}

fn print_license_statuses(manager: &ModuleManager) -> anyhow::Result<()> {
    let results = manager.verify_licenses()?;
    if results.is_empty() {
        println!("No licenses to verify");
    }
    for (module, status) in results {
        match status {
            LicenseStatus::Valid { valid_until } => {
                println!("{:<24} valid until {}", module, valid_until)
            }
            LicenseStatus::Invalid { message } => println!("{:<24} invalid: {}", module, message),
        }
    }
    Ok(())
}
