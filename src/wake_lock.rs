//! Keep the machine awake while a session is live
//!
//! Uses the platform idle inhibitor: `systemd-inhibit` on Linux, `caffeinate` on
//! macOS. Elsewhere the lock is a no-op.

use std::process::{Child, Command, Stdio};

use crate::{Error, Result};

/// A held-or-not sleep inhibitor
pub trait WakeLock: Send {
    /// Start inhibiting sleep; acquiring a held lock is a no-op
    ///
    /// # Errors
    ///
    /// Returns error if the platform inhibitor cannot be started
    fn acquire(&mut self) -> Result<()>;

    /// Stop inhibiting sleep; releasing a free lock is a no-op
    fn release(&mut self);

    /// Whether the lock is currently held
    fn is_held(&self) -> bool;
}

/// Wake lock that does nothing
#[derive(Debug, Default)]
pub struct NoopWakeLock {
    held: bool,
}

impl WakeLock for NoopWakeLock {
    fn acquire(&mut self) -> Result<()> {
        self.held = true;
        Ok(())
    }

    fn release(&mut self) {
        self.held = false;
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

/// Wake lock backed by an inhibitor child process
///
/// The inhibitor lives exactly as long as the child; releasing kills it.
#[derive(Debug)]
pub struct SystemWakeLock {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl SystemWakeLock {
    /// Inhibitor that runs `program args..` until killed
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }

    /// The inhibitor for this platform, if there is one
    #[must_use]
    pub fn for_platform() -> Option<Self> {
        #[cfg(target_os = "linux")]
        return Some(Self::new(
            "systemd-inhibit",
            [
                "--what=idle:sleep",
                "--who=beacon-live",
                "--why=Live voice session",
                "--mode=block",
                "sleep",
                "infinity",
            ]
            .map(String::from)
            .to_vec(),
        ));

        #[cfg(target_os = "macos")]
        return Some(Self::new("caffeinate", vec!["-i".to_string()]));

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        None
    }
}

impl WakeLock for SystemWakeLock {
    fn acquire(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Device(format!("failed to start {}: {e}", self.program)))?;

        tracing::debug!(program = %self.program, pid = child.id(), "wake lock acquired");
        self.child = Some(child);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "wake lock process already gone");
            }
            let _ = child.wait();
            tracing::debug!(program = %self.program, "wake lock released");
        }
    }

    fn is_held(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for SystemWakeLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Platform wake lock, or a no-op where none exists
#[must_use]
pub fn default_wake_lock() -> Box<dyn WakeLock> {
    match SystemWakeLock::for_platform() {
        Some(lock) => Box::new(lock),
        None => Box::new(NoopWakeLock::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_tracks_held() {
        let mut lock = NoopWakeLock::default();
        lock.acquire().unwrap();
        assert!(lock.is_held());
        lock.release();
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn missing_inhibitor_is_an_error() {
        let mut lock = SystemWakeLock::new("/nonexistent/inhibitor", Vec::new());
        assert!(lock.acquire().is_err());
        assert!(!lock.is_held());
    }

    #[cfg(unix)]
    #[test]
    fn child_lives_while_held() {
        let mut lock = SystemWakeLock::new("sleep", vec!["30".to_string()]);
        lock.acquire().unwrap();
        lock.acquire().unwrap();
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }
}
