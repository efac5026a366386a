//! Module lifecycle orchestration.
//!
//! [`ModuleManager`] drives install, enable, disable, uninstall and update
//! over the registry, the extractor, the dependency checks and the backup
//! manager. Every mutating operation holds the registry lock from its first
//! registry read to its last registry write.
//!
//! Module states:
//!
//! ```text
//! absent -> staged -> installed-disabled <-> installed-enabled
//! installed-* -> absent                      (uninstall)
//! installed-X -> absent -> installed-X'      (update, rolled back on failure)
//! ```

use anyhow::anyhow;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::commands::{
    install_steps, post_install_steps, post_uninstall_steps, pre_uninstall_steps, publish_step,
    CommandRunner, ProcessCommandRunner,
};
use crate::config::ManagerConfig;
use crate::dependency::{check_dependencies, check_dependents};
use crate::download::{Downloader, HttpDownloader};
use crate::error::{ModuleError, Result};
use crate::license::{
    item_field, EnvatoClient, LicenseRecord, LicenseStatus, LicenseStore, LicenseVerifier,
    Purchase, PurchaseAuthority, Verification,
};
use crate::lock::RegistryLock;
use crate::marketplace::{AvailableModule, HttpMarketplace, MarketplaceFeed};
use crate::module::{kebab_case, InstalledModule};
use crate::operations::{copy_directory_recursive, delete_path, BackupManager};
use crate::registry::{
    find_installed, module_root, reconcile, scan_installed, Statuses, StatusRegistry, SyncChanges,
};
use crate::version::{is_newer, parse_version, Version};

/// Upper bound for a single external command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(900);

/// Lifecycle operation names, as they appear in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Enable,
    Disable,
    Uninstall,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Enable => "enable",
            Operation::Disable => "disable",
            Operation::Uninstall => "uninstall",
            Operation::Update => "update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful outcome of a lifecycle operation.
///
/// `warnings` lists the best-effort steps that failed without undoing the
/// state change (post-install commands, pre-uninstall commands, asset cleanup).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub module: String,
    pub operation: Operation,
    pub message: String,
    pub warnings: Vec<String>,
}

impl OperationReport {
    fn new(module: &str, operation: Operation, message: String, warnings: Vec<String>) -> Self {
        Self {
            module: module.to_string(),
            operation,
            message,
            warnings,
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Where a newer version can be fetched from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum UpdateSource {
    Marketplace { download_url: String },
    Purchase { purchase_code: String },
}

/// A newer version available for an installed module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInfo {
    pub current_version: Version,
    pub new_version: Version,
    pub description: String,
    #[serde(flatten)]
    pub source: UpdateSource,
}

/// Orchestrates module lifecycle operations.
pub struct ModuleManager {
    config: ManagerConfig,
    registry: StatusRegistry,
    backups: BackupManager,
    licenses: LicenseStore,
    runner: Box<dyn CommandRunner>,
    downloader: Box<dyn Downloader>,
    marketplace: Option<Box<dyn MarketplaceFeed>>,
    authority: Option<Box<dyn PurchaseAuthority>>,
}

impl ModuleManager {
    /// Manager with explicit collaborators and no marketplace or purchase
    /// authority.
    pub fn new(
        config: ManagerConfig,
        runner: Box<dyn CommandRunner>,
        downloader: Box<dyn Downloader>,
    ) -> Self {
        Self {
            registry: StatusRegistry::new(config.registry_path()),
            backups: BackupManager::new(config.backups_dir()),
            licenses: LicenseStore::new(config.licenses_path()),
            config,
            runner,
            downloader,
            marketplace: None,
            authority: None,
        }
    }

    pub fn with_marketplace(mut self, feed: Box<dyn MarketplaceFeed>) -> Self {
        self.marketplace = Some(feed);
        self
    }

    pub fn with_authority(mut self, authority: Box<dyn PurchaseAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Production wiring: external commands run through `command_program`,
    /// HTTP collaborators are enabled when their settings are present.
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        let timeout = config.http_timeout();
        let runner = ProcessCommandRunner::new(
            config.command_program.clone(),
            config.base_dir.clone(),
            COMMAND_TIMEOUT,
        );
        let downloader = HttpDownloader::new(config.downloads_dir(), timeout)
            .map_err(|e| ModuleError::failed("Failed to set up downloader", e))?;

        let marketplace = match &config.marketplace_url {
            Some(url) => Some(
                HttpMarketplace::new(url, config.feed_cache_dir(), timeout)
                    .map_err(|e| ModuleError::failed("Failed to set up marketplace feed", e))?,
            ),
            None => None,
        };
        let authority = match &config.envato_api_token {
            Some(token) => Some(
                EnvatoClient::new(&config.envato_api_url, token, timeout)
                    .map_err(|e| ModuleError::failed("Failed to set up Envato client", e))?
                    .with_cache_dir(config.feed_cache_dir()),
            ),
            None => None,
        };

        let mut manager = Self::new(config, Box::new(runner), Box::new(downloader));
        if let Some(feed) = marketplace {
            manager = manager.with_marketplace(Box::new(feed));
        }
        if let Some(authority) = authority {
            manager = manager.with_authority(Box::new(authority));
        }
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn licenses(&self) -> &LicenseStore {
        &self.licenses
    }

    /// One-time setup: directories, an empty registry and an empty license
    /// store. Existing files are left alone.
    pub fn initialize(&self) -> Result<()> {
        let dirs = [
            self.config.modules_dir(),
            self.config.staging_dir(),
            self.config.backups_dir(),
            self.config.downloads_dir(),
            self.config.feed_cache_dir(),
            self.config.assets_dir(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .map_err(|e| ModuleError::failed(format!("Failed to create directory {:?}", dir), e))?;
        }

        self.registry
            .initialize()
            .map_err(|e| ModuleError::failed("Failed to initialize module registry", e))?;
        self.licenses
            .initialize()
            .map_err(|e| ModuleError::failed("Failed to initialize license store", e))?;

        info!(base_dir = ?self.config.base_dir, "Module manager initialized");
        Ok(())
    }

    /// Installed modules sorted by identifier.
    pub fn list(&self) -> Result<Vec<InstalledModule>> {
        let statuses = self.load_statuses()?;
        self.scan(&statuses)
    }

    /// Re-derive the registry from what is on disk.
    pub fn sync(&self) -> Result<SyncChanges> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let installed = self.scan(&statuses)?;

        let changes = reconcile(&mut statuses, &installed);
        if !changes.is_empty() {
            self.save_statuses(&statuses)?;
            info!(added = ?changes.added, removed = ?changes.removed, "Registry resynchronized");
        }
        Ok(changes)
    }

    /// Install a module package from a local archive. The module starts
    /// disabled.
    pub fn install(&self, archive_path: &Path) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let mut warnings = Vec::new();

        let name = self
            .install_locked(archive_path, None, &mut statuses, &mut warnings)
            .inspect_err(|e| log_failure(Operation::Install, &archive_path.display().to_string(), e))?;

        Ok(OperationReport::new(
            &name,
            Operation::Install,
            format!("Module {} installed successfully", name),
            warnings,
        ))
    }

    /// Download a package and install it. The download is removed afterwards.
    pub fn install_from_url(&self, url: &str, bearer: Option<&str>) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let mut warnings = Vec::new();

        let name = self
            .download_and_install(url, bearer, None, &mut statuses, &mut warnings)
            .inspect_err(|e| log_failure(Operation::Install, url, e))?;

        Ok(OperationReport::new(
            &name,
            Operation::Install,
            format!("Module {} installed successfully from URL", name),
            warnings,
        ))
    }

    /// Verify a purchase and install the purchased item. The license is
    /// recorded only once the module is installed, under the installed name.
    pub fn install_purchased(&self, purchase_code: &str) -> Result<OperationReport> {
        let authority = self.authority()?;
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let mut warnings = Vec::new();
        let verifier = LicenseVerifier::new(authority, &self.licenses);

        let purchase = verifier
            .check(purchase_code)
            .map_err(|reason| ModuleError::failed("Invalid purchase code", anyhow!(reason)))?;
        let url = authority
            .download_url(purchase_code)
            .map_err(|e| ModuleError::failed("Failed to get download URL", e))?;
        let name = self
            .download_and_install(&url, None, None, &mut statuses, &mut warnings)
            .inspect_err(|e| log_failure(Operation::Install, &purchase.module, e))?;

        if name != purchase.module {
            warn!(module = %name, purchased = %purchase.module, "Installed module differs from purchased item");
            warnings.push(format!(
                "Purchased item maps to {} but the package installed {}",
                purchase.module, name
            ));
        }
        let purchase = Purchase {
            module: name.clone(),
            ..purchase
        };
        if let Err(e) = verifier.record(purchase) {
            warn!(module = %name, error = %e, "Failed to record license");
            warnings.push(format!("Failed to record license: {:#}", e));
        }

        Ok(OperationReport::new(
            &name,
            Operation::Install,
            format!("Module {} installed successfully from purchase", name),
            warnings,
        ))
    }

    /// Mark a module enabled and re-run its post-install steps.
    pub fn enable(&self, name: &str) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let mut warnings = Vec::new();

        self.enable_locked(name, &mut statuses, &mut warnings)
            .inspect_err(|e| log_failure(Operation::Enable, name, e))?;

        Ok(OperationReport::new(
            name,
            Operation::Enable,
            format!("Module {} enabled successfully", name),
            warnings,
        ))
    }

    /// Mark a module disabled. Nothing on disk changes.
    pub fn disable(&self, name: &str) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;

        self.disable_locked(name, &mut statuses)
            .inspect_err(|e| log_failure(Operation::Disable, name, e))?;

        Ok(OperationReport::new(
            name,
            Operation::Disable,
            format!("Module {} disabled successfully", name),
            Vec::new(),
        ))
    }

    /// Remove a module, its published assets, its license records and its
    /// registry entry.
    ///
    /// Refused while another installed module requires it. Pre-uninstall
    /// command failures are reported as warnings and do not stop removal.
    pub fn uninstall(&self, name: &str) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;
        let mut warnings = Vec::new();

        self.uninstall_locked(name, &mut statuses, &mut warnings)
            .inspect_err(|e| log_failure(Operation::Uninstall, name, e))?;

        Ok(OperationReport::new(
            name,
            Operation::Uninstall,
            format!("Module {} uninstalled successfully", name),
            warnings,
        ))
    }

    /// Replace a module with the newer version advertised for it.
    ///
    /// The module directory is backed up first. Any failure after that point
    /// restores the backup and the previous enabled flag before the error is
    /// returned.
    pub fn update(&self, name: &str) -> Result<OperationReport> {
        let _lock = self.lock()?;
        let mut statuses = self.load_statuses()?;

        let result = self.update_locked(name, &mut statuses);
        let (info, warnings) = result.inspect_err(|e| log_failure(Operation::Update, name, e))?;

        Ok(OperationReport::new(
            name,
            Operation::Update,
            format!(
                "Module {} updated from version {} to {}",
                name, info.current_version, info.new_version
            ),
            warnings,
        ))
    }

    /// Newer versions available for installed modules, keyed by identifier.
    ///
    /// A licensed module is checked against its purchase first; the
    /// marketplace feed is consulted otherwise.
    pub fn check_for_updates(&self) -> Result<BTreeMap<String, UpdateInfo>> {
        let installed = self.list()?;
        let feed = self.available_modules();
        let licenses = self.license_records();

        let updates: BTreeMap<String, UpdateInfo> = installed
            .iter()
            .filter_map(|module| {
                self.update_for(module, &feed, &licenses)
                    .map(|info| (module.name().to_string(), info))
            })
            .collect();

        info!(count = updates.len(), "Update check finished");
        Ok(updates)
    }

    /// Marketplace listing. Empty when no feed is configured or it fails.
    pub fn available_modules(&self) -> Vec<AvailableModule> {
        let Some(feed) = &self.marketplace else {
            return Vec::new();
        };
        match feed.fetch() {
            Ok(modules) => modules,
            Err(e) => {
                warn!(error = %e, "Failed to fetch marketplace feed");
                Vec::new()
            }
        }
    }

    /// Check a purchase code and record the license on success.
    pub fn verify_purchase(&self, purchase_code: &str) -> Result<Verification> {
        let authority = self.authority()?;
        LicenseVerifier::new(authority, &self.licenses)
            .verify(purchase_code)
            .map_err(|e| ModuleError::failed("Failed to record license", e))
    }

    /// Purchases made with the configured Envato account.
    pub fn purchases(&self) -> Result<serde_json::Value> {
        self.authority()?
            .purchases()
            .map_err(|e| ModuleError::failed("Failed to list purchases", e))
    }

    /// Search the purchase authority's catalog.
    pub fn search_catalog(&self, term: &str, category: Option<&str>) -> Result<serde_json::Value> {
        self.authority()?
            .search_items(term, category)
            .map_err(|e| ModuleError::failed("Failed to search catalog", e))
    }

    /// Re-verify every stored license.
    pub fn verify_licenses(&self) -> Result<BTreeMap<String, LicenseStatus>> {
        let authority = self.authority()?;
        LicenseVerifier::new(authority, &self.licenses)
            .verify_all()
            .map_err(|e| ModuleError::failed("Failed to verify licenses", e))
    }

    /// True when some license was last checked longer ago than the configured
    /// verification interval.
    pub fn licenses_due(&self) -> Result<bool> {
        let records = self
            .licenses
            .load()
            .map_err(|e| ModuleError::failed("Failed to read license store", e))?;
        let interval = chrono::Duration::days(i64::from(self.config.license_verification_interval_days));
        let cutoff = chrono::Utc::now() - interval;
        Ok(records.iter().any(|r| r.updated_at <= cutoff))
    }

    fn install_locked(
        &self,
        archive_path: &Path,
        expected: Option<&str>,
        statuses: &mut Statuses,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        // Dropping `staged` removes the staging directory on every path.
        let staged = archive::extract(archive_path, &self.config.staging_dir())?;
        let module = &staged.module;
        let name = module.name.clone();

        if let Some(expected) = expected {
            if name != expected {
                return Err(ModuleError::InvalidPackage(format!(
                    "Package contains module {} but {} was expected",
                    name, expected
                )));
            }
        }

        let root = module_root(&self.config.modules_dir(), &name);
        if statuses.contains_key(&name) || root.exists() {
            return Err(ModuleError::AlreadyInstalled(name));
        }

        let installed = self.scan(statuses)?;
        check_dependencies(&module.requires, &installed)?;

        if let Err(e) = copy_directory_recursive(staged.module_dir(), &root) {
            let _ = delete_path(&root);
            return Err(ModuleError::failed(
                format!("Failed to copy files for module {}", name),
                e,
            ));
        }

        statuses.insert(name.clone(), false);
        if let Err(e) = self.save_statuses(statuses) {
            statuses.remove(&name);
            let _ = delete_path(&root);
            return Err(e);
        }
        info!(module = %name, version = %module.version, operation = "install", "Module files installed");

        let steps = install_steps(
            &name,
            &root,
            self.config.run_seeders,
            &module.post_install_commands,
        );
        self.run_steps(&name, Operation::Install, &steps, warnings);

        Ok(name)
    }

    fn download_and_install(
        &self,
        url: &str,
        bearer: Option<&str>,
        expected: Option<&str>,
        statuses: &mut Statuses,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        let archive_path = self
            .downloader
            .download(url, bearer)
            .map_err(|e| ModuleError::failed("Failed to download module", e))?;

        let result = self.install_locked(&archive_path, expected, statuses, warnings);
        if let Err(e) = delete_path(&archive_path) {
            warn!(path = ?archive_path, error = %e, "Failed to remove downloaded package");
        }
        result
    }

    fn enable_locked(
        &self,
        name: &str,
        statuses: &mut Statuses,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let module = self.resolve(name, statuses)?;

        statuses.insert(name.to_string(), true);
        self.save_statuses(statuses)?;
        info!(module = %name, operation = "enable", "Module enabled");

        let steps = post_install_steps(
            name,
            &module.root,
            self.config.run_seeders,
            &module.module.post_install_commands,
        );
        self.run_steps(name, Operation::Enable, &steps, warnings);
        Ok(())
    }

    fn disable_locked(&self, name: &str, statuses: &mut Statuses) -> Result<()> {
        self.resolve(name, statuses)?;

        statuses.insert(name.to_string(), false);
        self.save_statuses(statuses)?;
        info!(module = %name, operation = "disable", "Module disabled");
        Ok(())
    }

    fn uninstall_locked(
        &self,
        name: &str,
        statuses: &mut Statuses,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        ensure_identifier(name)?;
        let root = module_root(&self.config.modules_dir(), name);

        // The directory is what counts; a broken manifest does not save it.
        let module = match find_installed(&self.config.modules_dir(), name, statuses) {
            Ok(module) => module,
            Err(e) => {
                warn!(module = %name, error = %e, "Uninstalling module with unreadable manifest");
                None
            }
        };
        if module.is_none() && !root.exists() {
            if statuses.remove(name).is_some() {
                self.save_statuses(statuses)?;
            }
            return Err(ModuleError::NotFound(name.to_string()));
        }

        let installed = self.scan(statuses)?;
        check_dependents(name, &installed)?;

        if statuses.get(name).copied().unwrap_or(false) {
            statuses.insert(name.to_string(), false);
            self.save_statuses(statuses)?;
            info!(module = %name, operation = "uninstall", "Module disabled before removal");
        }

        let declared = module
            .as_ref()
            .map(|m| m.module.pre_uninstall_commands.clone())
            .unwrap_or_default();
        self.run_steps(
            name,
            Operation::Uninstall,
            &pre_uninstall_steps(name, &declared),
            warnings,
        );

        self.remove_module_files(name, &root, statuses)?;

        if let Err(e) = self.remove_published_assets(name) {
            warn!(module = %name, operation = "uninstall", error = %e, "Failed to remove published assets");
            warnings.push(format!("Failed to remove published assets: {:#}", e));
        }
        self.run_steps(name, Operation::Uninstall, &post_uninstall_steps(), warnings);

        match self.licenses.remove_module(name) {
            Ok(0) => {}
            Ok(removed) => debug!(module = %name, removed, "License records removed"),
            Err(e) => {
                warn!(module = %name, operation = "uninstall", error = %e, "Failed to remove license records");
                warnings.push(format!("Failed to remove license records: {:#}", e));
            }
        }

        info!(module = %name, operation = "uninstall", "Module uninstalled");
        Ok(())
    }

    /// Delete the module root, then its registry entry.
    fn remove_module_files(&self, name: &str, root: &Path, statuses: &mut Statuses) -> Result<()> {
        delete_path(root).map_err(|e| {
            ModuleError::failed(format!("Failed to delete files for module {}", name), e)
        })?;
        statuses.remove(name);
        self.save_statuses(statuses)
    }

    /// Delete `<assets_dir>/<kebab-case id>`.
    fn remove_published_assets(&self, name: &str) -> anyhow::Result<()> {
        delete_path(&self.config.assets_dir().join(kebab_case(name)))
    }

    fn update_locked(
        &self,
        name: &str,
        statuses: &mut Statuses,
    ) -> Result<(UpdateInfo, Vec<String>)> {
        let current = self.resolve(name, statuses)?;
        let feed = self.available_modules();
        let licenses = self.license_records();
        let info = self
            .update_for(&current, &feed, &licenses)
            .ok_or_else(|| ModuleError::NoUpdateAvailable(name.to_string()))?;

        let was_enabled = current.enabled;
        let snapshot = self.backups.backup(&current.root).map_err(|e| {
            ModuleError::failed(format!("Failed to create backup for module {}", name), e)
        })?;

        let mut warnings = Vec::new();
        match self.replace_module(&current, &info, was_enabled, statuses, &mut warnings) {
            Ok(()) => {
                self.backups.discard(&snapshot);
                info!(
                    module = %name,
                    operation = "update",
                    from = %info.current_version,
                    to = %info.new_version,
                    "Module updated"
                );
                Ok((info, warnings))
            }
            Err(err) => {
                warn!(module = %name, operation = "update", error = %err, "Update failed; restoring backup");
                match self.restore_after_failed_update(&current, &snapshot, was_enabled, statuses) {
                    Ok(()) => {
                        self.backups.discard(&snapshot);
                        Err(err)
                    }
                    // The snapshot is kept so it can be restored by hand.
                    Err(restore_err) => Err(ModuleError::failed(
                        format!(
                            "Update of module {} failed ({}) and restoring backup {:?} also failed",
                            name, err, snapshot
                        ),
                        restore_err,
                    )),
                }
            }
        }
    }

    /// Remove the installed version without its pre-uninstall steps, install
    /// the new one and put the enabled flag back.
    fn replace_module(
        &self,
        current: &InstalledModule,
        info: &UpdateInfo,
        was_enabled: bool,
        statuses: &mut Statuses,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let name = current.name();
        self.remove_module_files(name, &current.root, statuses)?;
        self.remove_published_assets(name).map_err(|e| {
            ModuleError::failed(format!("Failed to remove published assets for module {}", name), e)
        })?;

        let url = match &info.source {
            UpdateSource::Marketplace { download_url } => download_url.clone(),
            UpdateSource::Purchase { purchase_code } => self
                .authority()?
                .download_url(purchase_code)
                .map_err(|e| ModuleError::failed("Failed to get download URL", e))?,
        };

        self.download_and_install(&url, None, Some(name), statuses, warnings)?;

        if was_enabled {
            self.enable_locked(name, statuses, warnings)
        } else {
            self.disable_locked(name, statuses)
        }
    }

    fn restore_after_failed_update(
        &self,
        current: &InstalledModule,
        snapshot: &Path,
        was_enabled: bool,
        statuses: &mut Statuses,
    ) -> anyhow::Result<()> {
        self.backups.restore(&current.root, snapshot)?;

        *statuses = self.registry.load()?;
        statuses.insert(current.name().to_string(), was_enabled);
        self.registry.save(statuses)?;

        // The old assets were removed with the old files.
        if current.root.join("resources/assets").exists() {
            let step = publish_step(current.name());
            if let Err(e) = self.runner.run(&step) {
                warn!(module = %current.name(), command = %step, error = %e, "Failed to republish assets");
            }
        }

        info!(module = %current.name(), operation = "update", "Module restored to its previous version");
        Ok(())
    }

    fn update_for(
        &self,
        module: &InstalledModule,
        feed: &[AvailableModule],
        licenses: &[LicenseRecord],
    ) -> Option<UpdateInfo> {
        if let Some(info) = self.purchased_update(module, licenses) {
            return Some(info);
        }

        let entry = feed.iter().find(|m| m.name == module.name())?;
        let Some(download_url) = entry.download_url.clone() else {
            debug!(module = %module.name(), "Marketplace entry has no download URL");
            return None;
        };
        let version = match parse_version(&entry.version) {
            Ok(version) => version,
            Err(e) => {
                warn!(module = %module.name(), version = %entry.version, error = %e, "Ignoring marketplace entry with bad version");
                return None;
            }
        };
        is_newer(&version, module.version()).then(|| UpdateInfo {
            current_version: module.version().clone(),
            new_version: version,
            description: entry.description.clone(),
            source: UpdateSource::Marketplace { download_url },
        })
    }

    fn purchased_update(
        &self,
        module: &InstalledModule,
        licenses: &[LicenseRecord],
    ) -> Option<UpdateInfo> {
        let authority = self.authority.as_deref()?;
        let record = licenses.iter().find(|r| r.module == module.name())?;

        let payload = match authority.verify_purchase(&record.purchase_code) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(module = %module.name(), error = %e, "Failed to check purchase for updates");
                return None;
            }
        };
        let version = parse_version(&item_field(&payload, "version")?).ok()?;

        is_newer(&version, module.version()).then(|| UpdateInfo {
            current_version: module.version().clone(),
            new_version: version,
            description: item_field(&payload, "description").unwrap_or_default(),
            source: UpdateSource::Purchase {
                purchase_code: record.purchase_code.clone(),
            },
        })
    }

    /// Look the module up on disk. A missing module triggers one registry
    /// resync (dropping stale entries) before `NotFound` is returned.
    fn resolve(&self, name: &str, statuses: &mut Statuses) -> Result<InstalledModule> {
        ensure_identifier(name)?;
        if let Some(module) = find_installed(&self.config.modules_dir(), name, statuses)? {
            return Ok(module);
        }

        debug!(module = %name, "Module not on disk; resynchronizing registry");
        let installed = self.scan(statuses)?;
        let changes = reconcile(statuses, &installed);
        if !changes.is_empty() {
            self.save_statuses(statuses)?;
        }

        installed
            .into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))
    }

    fn run_steps(&self, name: &str, operation: Operation, steps: &[String], warnings: &mut Vec<String>) {
        for step in steps {
            if let Err(e) = self.runner.run(step) {
                warn!(module = %name, operation = %operation, command = %step, error = %e, "Command failed");
                warnings.push(format!("Command '{}' failed: {:#}", step, e));
            }
        }
    }

    fn authority(&self) -> Result<&dyn PurchaseAuthority> {
        self.authority.as_deref().ok_or_else(|| {
            ModuleError::failed(
                "License verification unavailable",
                anyhow!("no Envato API token configured"),
            )
        })
    }

    fn license_records(&self) -> Vec<LicenseRecord> {
        self.licenses.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read license store");
            Vec::new()
        })
    }

    fn lock(&self) -> Result<RegistryLock> {
        RegistryLock::acquire(self.registry.path(), self.config.lock_timeout())
            .map_err(|e| ModuleError::failed("Failed to lock module registry", e))
    }

    fn load_statuses(&self) -> Result<Statuses> {
        self.registry
            .load()
            .map_err(|e| ModuleError::failed("Failed to read module registry", e))
    }

    fn save_statuses(&self, statuses: &Statuses) -> Result<()> {
        self.registry
            .save(statuses)
            .map_err(|e| ModuleError::failed("Failed to save module registry", e))
    }

    fn scan(&self, statuses: &Statuses) -> Result<Vec<InstalledModule>> {
        scan_installed(&self.config.modules_dir(), statuses)
            .map_err(|e| ModuleError::failed("Failed to scan modules directory", e))
    }
}

/// Identifiers name a directory directly under the modules root.
fn ensure_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ModuleError::NotFound(name.to_string()));
    }
    Ok(())
}

fn log_failure(operation: Operation, module: &str, error: &ModuleError) {
    if error.is_validation() {
        warn!(module = %module, operation = %operation, error = %error, "Operation rejected");
    } else {
        error!(module = %module, operation = %operation, error = %error, "Operation failed");
    }
}

