//! Application context hooks.
//!
//! The core knows nothing about the bus topology: how the application
//! firmware on every target is silenced and how a single target is forced
//! into its ROM bootloader is the user's business.  These three methods are
//! the entire boundary; deployments implement [`ContextHooks`] for their
//! own hardware.

use std::fmt;
use std::time::Duration;

use log::{debug, info};

/// Application-level target identifier, e.g. a bus address.
///
/// The core never interprets the value; only the hooks do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for TargetId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// User-supplied bus control.
pub trait ContextHooks {
    /// Silences the application firmware on every listed target.  Sticky:
    /// stays in effect until [`ContextHooks::release_all`].
    fn be_quiet(&mut self, targets: &[TargetId]) -> anyhow::Result<()>;

    /// Forces one target into its ROM bootloader; afterwards only this
    /// target may answer on the bus.
    fn enter_bootloader(&mut self, target: TargetId) -> anyhow::Result<()>;

    /// Lets every target run its application again.
    fn release_all(&mut self) -> anyhow::Result<()>;
}

/// Hooks for bench setups where a fixture (or the operator) holds
/// non-selected targets quiet and resets the selected one into its
/// bootloader.  Logs each step and waits a settle delay instead of driving
/// any hardware.
pub struct ManualHooks {
    pub settle: Duration,
}

impl Default for ManualHooks {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
        }
    }
}

impl ContextHooks for ManualHooks {
    fn be_quiet(&mut self, targets: &[TargetId]) -> anyhow::Result<()> {
        debug!("assuming {} targets are already quiet", targets.len());
        Ok(())
    }

    fn enter_bootloader(&mut self, target: TargetId) -> anyhow::Result<()> {
        info!("expecting target {target} to be in bootloader mode");
        std::thread::sleep(self.settle);
        Ok(())
    }

    fn release_all(&mut self) -> anyhow::Result<()> {
        debug!("releasing all targets");
        Ok(())
    }
}
