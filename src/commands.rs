//! External task runner used for migrations, seeding, asset publishing and
//! the commands a manifest declares.
//!
//! The manager only knows command identifiers such as `module:migrate Blog`;
//! how they execute is up to the [`CommandRunner`] it was built with.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runs an opaque command identified by a string.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<()>;
}

/// Runs commands as `<program> <leading args...> <command words...>`, e.g.
/// `php artisan module:migrate Blog`.
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner {
    program: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ProcessCommandRunner {
    pub fn new(program: Vec<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program,
            working_dir: working_dir.into(),
            timeout,
        }
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, command: &str) -> Result<()> {
        let Some((binary, leading)) = self.program.split_first() else {
            bail!("No command program configured");
        };

        let mut process = Command::new(binary);
        process
            .args(leading)
            .args(command.split_whitespace())
            .current_dir(&self.working_dir);
        debug!(command = %command, program = %binary, "Running external command");

        let mut child = process
            .spawn()
            .context(format!("Failed to start '{} {}'", binary, command))?;

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "Command '{}' timed out after {}s",
                    command,
                    self.timeout.as_secs()
                );
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        if !status.success() {
            bail!("Command '{}' exited with {}", command, status);
        }
        info!(command = %command, "External command finished");
        Ok(())
    }
}

/// Rebuilds the application's autoload data after the modules directory changes.
pub const UPDATE_COMPOSER: &str = "modules:update-composer";

/// Commands run once a package has been copied in: the autoload refresh, then
/// the post-install steps.
pub fn install_steps(
    name: &str,
    root: &Path,
    run_seeders: bool,
    declared: &[String],
) -> Vec<String> {
    let mut steps = vec![UPDATE_COMPOSER.to_string()];
    steps.extend(post_install_steps(name, root, run_seeders, declared));
    steps
}

/// Commands run after install and on every enable.
pub fn post_install_steps(
    name: &str,
    root: &Path,
    run_seeders: bool,
    declared: &[String],
) -> Vec<String> {
    let mut steps = Vec::new();

    if root.join("database/migrations").exists() {
        steps.push(format!("module:migrate {}", name));
    }
    if run_seeders && root.join("database/seeders").exists() {
        steps.push(format!("module:seed {}", name));
    }
    if root.join("resources/assets").exists() {
        steps.push(publish_step(name));
    }
    steps.extend(declared.iter().cloned());
    steps.push("cache:clear".to_string());

    steps
}

/// Copies a module's `resources/assets` into the public assets directory.
pub fn publish_step(name: &str) -> String {
    format!("module:publish {}", name)
}

/// Commands run before a module is removed for good.
pub fn pre_uninstall_steps(name: &str, declared: &[String]) -> Vec<String> {
    let mut steps: Vec<String> = declared.to_vec();
    steps.push(format!("module:migrate-rollback {}", name));
    steps
}

/// Commands run once a module's files are gone.
pub fn post_uninstall_steps() -> Vec<String> {
    vec![UPDATE_COMPOSER.to_string(), "cache:clear".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn post_install_steps_follow_module_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Blog");
        fs::create_dir_all(root.join("database/migrations")).unwrap();
        fs::create_dir_all(root.join("database/seeders")).unwrap();

        let steps = post_install_steps("Blog", &root, false, &["blog:warm".to_string()]);
        assert_eq!(steps, vec!["module:migrate Blog", "blog:warm", "cache:clear"]);

        fs::create_dir_all(root.join("resources/assets")).unwrap();
        let steps = post_install_steps("Blog", &root, true, &[]);
        assert_eq!(
            steps,
            vec![
                "module:migrate Blog",
                "module:seed Blog",
                "module:publish Blog",
                "cache:clear"
            ]
        );
    }

    #[test]
    fn install_refreshes_autoload_first() {
        let dir = tempfile::tempdir().unwrap();
        let steps = install_steps("Blog", &dir.path().join("Blog"), false, &[]);
        assert_eq!(steps, vec![UPDATE_COMPOSER, "cache:clear"]);
    }

    #[test]
    fn pre_uninstall_runs_declared_then_rollback() {
        let steps = pre_uninstall_steps("Forum", &["forum:export".to_string()]);
        assert_eq!(steps, vec!["forum:export", "module:migrate-rollback Forum"]);
        assert_eq!(post_uninstall_steps(), vec!["modules:update-composer", "cache:clear"]);
    }

    #[test]
    fn empty_program_is_an_error() {
        let runner = ProcessCommandRunner::new(Vec::new(), ".", Duration::from_secs(1));
        assert!(runner.run("cache:clear").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ok = ProcessCommandRunner::new(vec!["true".into()], dir.path(), Duration::from_secs(5));
        assert!(ok.run("cache:clear").is_ok());

        let fail =
            ProcessCommandRunner::new(vec!["false".into()], dir.path(), Duration::from_secs(5));
        assert!(fail.run("cache:clear").is_err());
    }
}
