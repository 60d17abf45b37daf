//! Fleet driver.
//!
//! Sequences one session per target over the shared bus, keeps a per-target
//! outcome table and continues past individual failures.  The driver owns
//! the transport (wrapped in the command layer) and lends it to one session
//! at a time; between targets it refreshes the bus silence and waits a
//! short idle period.

use std::time::Duration;

use log::{info, warn};

use crate::bootloader::{Bootloader, Timeouts};
use crate::device::McuDescriptor;
use crate::error::{Error, Result};
use crate::hooks::{ContextHooks, TargetId};
use crate::image::HexImage;
use crate::plan::Plan;
use crate::session::{CancelToken, Session, SessionConfig, TargetOutcome};
use crate::transport::Transport;

/// Run-wide configuration.
#[derive(Clone, Copy, Debug)]
pub struct FleetConfig {
    pub timeouts: Timeouts,
    pub session: SessionConfig,
    /// Bus-idle gap between two targets.
    pub inter_target_delay: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            session: SessionConfig::default(),
            inter_target_delay: Duration::from_millis(50),
        }
    }
}

/// Per-target outcomes of one run.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: Vec<(TargetId, TargetOutcome)>,
    pub cancelled: bool,
}

impl FleetReport {
    pub fn all_done(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_done())
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| !o.is_done()).count()
    }

    /// Writes the final per-target summary to the log.
    pub fn log_summary(&self) {
        for (target, outcome) in &self.outcomes {
            match outcome {
                TargetOutcome::Done(report) => {
                    let version = report
                        .bootloader_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| String::from("?"));
                    info!(
                        "target {target}: done (bootloader v{version}, {} erases, {} writes, {} restarts)",
                        report.erases, report.writes, report.restarts
                    );
                }
                TargetOutcome::Failed(failure) => {
                    warn!("target {target}: failed: {failure}");
                }
            }
        }
        if self.cancelled {
            warn!("run cancelled before all targets were programmed");
        }
    }
}

/// Drives sessions for a list of targets over one serial transport.
pub struct FleetDriver<T, H> {
    bootloader: Bootloader<T>,
    hooks: H,
    config: FleetConfig,
    cancel: CancelToken,
}

impl<T: Transport, H: ContextHooks> FleetDriver<T, H> {
    pub fn new(transport: T, hooks: H, config: FleetConfig) -> Self {
        let bootloader = Bootloader::new(
            transport,
            config.timeouts,
            config.session.limits.command,
        );
        Self {
            bootloader,
            hooks,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token for the CLI (or embedder) to request a cooperative abort.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn reopens(&self) -> u32 {
        self.bootloader.reopens()
    }

    /// Programs `image` into every listed target.
    ///
    /// The plan is derived up front so a planning problem aborts the run
    /// before anything touches the bus.
    pub fn run(
        &mut self,
        targets: &[TargetId],
        image: &HexImage,
        descriptor: &McuDescriptor,
    ) -> Result<FleetReport> {
        let plan = Plan::build(image, descriptor)?;
        if plan.is_empty() {
            warn!("image is empty; nothing to program");
        }
        info!(
            "programming {} targets with {} chunks across {} sectors",
            targets.len(),
            plan.chunks().len(),
            plan.dirty_sectors().len()
        );

        let mut report = FleetReport::default();
        for (index, &target) in targets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if index > 0 {
                // Bus-idle boundary before the next target.
                if let Err(e) = self.hooks.be_quiet(targets) {
                    warn!("be_quiet refresh failed: {e:#}");
                }
                std::thread::sleep(self.config.inter_target_delay);
            }

            let session = Session::new(
                &mut self.bootloader,
                &mut self.hooks,
                descriptor,
                &plan,
                targets,
                target,
                self.config.session,
                self.cancel.clone(),
            );
            let outcome = session.run();
            if let TargetOutcome::Failed(failure) = &outcome {
                if matches!(failure.error, Error::Cancelled) {
                    report.cancelled = true;
                }
            }
            report.outcomes.push((target, outcome));
            if report.cancelled {
                break;
            }
        }

        if let Err(e) = self.hooks.release_all() {
            warn!("release_all failed: {e:#}");
        }
        Ok(report)
    }
}

/// Parses a target list such as `1,3-5,8` into ascending-order ids.
///
/// Singles and inclusive ranges, comma-separated.  Duplicates collapse.
pub fn parse_target_spec(spec: &str) -> Result<Vec<TargetId>> {
    let mut ids: Vec<u32> = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::TargetSpec(format!("empty entry in `{spec}`")));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = parse_id(lo)?;
                let hi: u32 = parse_id(hi)?;
                if hi < lo {
                    return Err(Error::TargetSpec(format!("descending range `{part}`")));
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(parse_id(part)?),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids.into_iter().map(TargetId).collect())
}

fn parse_id(text: &str) -> Result<u32> {
    text.trim()
        .parse()
        .map_err(|_| Error::TargetSpec(format!("invalid target id `{}`", text.trim())))
}
