//! Browser process launch.
//!
//! Launch is the fallback when attach is not preferred or finds nothing.
//! Arguments are deterministic and conflict-avoiding: an ephemeral debug
//! port picked by the OS, a throwaway user-data directory, and no shared
//! state with any browser the user is running themselves.
//!
//! A launched browser is the only kind this process is ever allowed to
//! terminate.

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Well-known executable locations, tried in order.
const DEFAULT_EXECUTABLES: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Default grace period between `Browser.close` and a forced kill.
pub(crate) const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

// ============================================================================
// LaunchOptions
// ============================================================================

/// Browser launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit executable path; auto-discovered when `None`.
    pub executable: Option<PathBuf>,

    /// Run without a visible window.
    pub headless: bool,

    /// Hide the "controlled by automated software" banner.
    pub suppress_automation_banner: bool,

    /// Additional command-line arguments.
    pub extra_args: Vec<String>,

    /// How long a graceful close may take before the process is killed.
    pub grace_period: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: false,
            suppress_automation_banner: false,
            extra_args: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl LaunchOptions {
    /// Builds the deterministic argument list.
    #[must_use]
    pub fn to_args(&self, port: u16, user_data_dir: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={port}"),
            format!("--user-data-dir={}", user_data_dir.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-background-networking".to_string(),
        ];

        if self.headless {
            args.push("--headless=new".to_string());
        }
        if self.suppress_automation_banner {
            args.push("--disable-infobars".to_string());
            args.push("--disable-blink-features=AutomationControlled".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Resolves the executable path.
    ///
    /// # Errors
    ///
    /// [`Error::BrowserNotFound`] for an explicit path that does not
    /// exist; [`Error::Config`] when auto-discovery finds nothing.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.executable {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::browser_not_found(path.clone()));
        }

        DEFAULT_EXECUTABLES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| {
                Error::config("no browser executable found; set LaunchOptions::executable")
            })
    }
}

// ============================================================================
// LaunchedBrowser
// ============================================================================

/// A browser process this control plane launched and therefore owns.
#[derive(Debug)]
pub struct LaunchedBrowser {
    child: Child,
    /// Deleted on drop, removing the throwaway profile.
    _user_data_dir: TempDir,
    /// Debug port the browser was told to listen on.
    pub port: u16,
    grace_period: Duration,
}

impl LaunchedBrowser {
    /// Returns the OS process ID, if the process is still running.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit on its own, then force-kills it
    /// after the grace period.
    ///
    /// The graceful `Browser.close` protocol call happens before this is
    /// invoked; this handles only the process side.
    pub async fn finish(mut self) {
        match timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Browser exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed waiting for browser exit");
            }
            Err(_) => {
                warn!(
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Browser did not exit in time, killing"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Kill failed");
                }
            }
        }
    }
}

// ============================================================================
// Launch
// ============================================================================

/// Picks an ephemeral TCP port by binding port 0 and releasing it.
fn pick_ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawns a browser process configured for debugging.
///
/// The process is started but not yet probed; the caller polls the
/// discovery endpoint until the debug port answers.
///
/// # Errors
///
/// [`Error::BrowserNotFound`] / [`Error::Config`] for executable
/// problems, [`Error::LaunchFailed`] when the spawn itself fails.
pub fn launch(options: &LaunchOptions) -> Result<LaunchedBrowser> {
    let executable = options.resolve_executable()?;
    let port = pick_ephemeral_port()?;
    let user_data_dir = tempfile::tempdir()?;

    let args = options.to_args(port, user_data_dir.path());

    let child = Command::new(&executable)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::launch_failed(format!("{}: {e}", executable.display())))?;

    info!(
        pid = child.id(),
        port,
        executable = %executable.display(),
        "Browser process launched"
    );

    Ok(LaunchedBrowser {
        child,
        _user_data_dir: user_data_dir,
        port,
        grace_period: options.grace_period,
    })
}

// ============================================================================
// Tests
// ============================================================================
