//! ModuleDepot Core Library
//!
//! Lifecycle manager for pluggable application modules: install, enable,
//! disable, uninstall and update, with backup-and-restore around updates and
//! purchase-code licensing.
//!
//! # Core Features
//!
//! ## Lifecycle (`manager` module)
//! - `install()` / `install_from_url()` / `install_purchased()` - Stage, check and copy a package
//! - `enable()` / `disable()` - Flip the registry flag, re-run post-install steps on enable
//! - `uninstall()` - Refused while other modules depend on the target
//! - `update()` - Backup, replace, and restore the old version on any failure
//! - `check_for_updates()` - Compare installed versions with the marketplace and purchases
//!
//! ## Storage (`registry`, `license`, `operations` modules)
//! - `modules_statuses.json` - identifier -> enabled flag, saved atomically
//! - `module_licenses.json` - verified purchases, upserted on (module, purchase code)
//! - Timestamped full-copy backups under `module_backups/`
//!
//! ## Collaborators
//! - `CommandRunner` - migrations, seeding, asset publishing and manifest commands
//! - `Downloader` - package downloads
//! - `MarketplaceFeed` - available modules and versions
//! - `PurchaseAuthority` - purchase-code verification (Envato API)

pub mod archive;
pub mod commands;
pub mod config;
pub mod dependency;
pub mod download;
pub mod error;
pub mod license;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod marketplace;
pub mod module;
pub mod operations;
pub mod registry;
pub mod version;

pub use config::ManagerConfig;
pub use error::{ModuleError, Result};
pub use manager::{ModuleManager, Operation, OperationReport, UpdateInfo, UpdateSource};
pub use module::{InstalledModule, Module, ModuleManifest};
