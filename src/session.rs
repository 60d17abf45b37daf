//! Per-target programming session.
//!
//! A session drives one target through silence, bootloader entry,
//! handshake, identification and the erase/write/verify loop.  Recovery is
//! an explicit state machine with attempt counters rather than nested
//! control flow: each budget (erase, chunk, sector recovery, session
//! restart) is counted in one place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bootloader::{Bootloader, EraseKind, ProtocolVersion};
use crate::device::McuDescriptor;
use crate::error::{Error, Result};
use crate::hooks::{ContextHooks, TargetId};
use crate::image::PAD_BYTE;
use crate::plan::{Chunk, Plan};
use crate::transport::Transport;

/// Attempt ceilings for the session's retry budgets.
#[derive(Clone, Copy, Debug)]
pub struct RetryLimits {
    /// Low-level request/response retries per command.
    pub command: u32,
    /// Erase attempts per sector, blank check included.
    pub erase: u32,
    /// Write/verify attempts per chunk before escalating.
    pub chunk: u32,
    /// Re-erase-and-rewrite passes per sector after chunk exhaustion.
    pub sector_recover: u32,
    /// Bootloader re-entries per target after persistent protocol failure.
    pub session_restart: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            command: 3,
            erase: 3,
            chunk: 3,
            sector_recover: 2,
            session_restart: 2,
        }
    }
}

/// Cooperative cancellation flag, polled between commands and chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a session currently is.  The `Failed` reason travels separately
/// in [`TargetFailure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Silenced,
    BootloaderEntered,
    Handshaked,
    Identified,
    Erasing(u16),
    Writing { chunk: usize, attempt: u32 },
    Done,
    Failed,
}

/// Counters and identity gathered while programming one target.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionReport {
    pub bootloader_version: Option<ProtocolVersion>,
    pub erases: u32,
    pub writes: u32,
    pub restarts: u32,
}

/// Terminal failure with the coordinates where it was observed.
#[derive(Debug)]
pub struct TargetFailure {
    pub error: Error,
    pub sector: Option<u16>,
    pub chunk_address: Option<u32>,
    pub report: SessionReport,
}

impl std::fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(sector) = self.sector {
            write!(f, " (sector {sector}")?;
            if let Some(address) = self.chunk_address {
                write!(f, ", chunk at 0x{address:08X}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Outcome of one target.
#[derive(Debug)]
pub enum TargetOutcome {
    Done(SessionReport),
    Failed(TargetFailure),
}

impl TargetOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TargetOutcome::Done(_))
    }
}

/// Per-session knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionConfig {
    pub limits: RetryLimits,
    /// Issue `GO` at the flash base after a successful run.
    pub go_after: bool,
}

/// One programming session; owns no bus resources beyond its borrows.
pub struct Session<'a, T, H> {
    bootloader: &'a mut Bootloader<T>,
    hooks: &'a mut H,
    descriptor: &'a McuDescriptor,
    plan: &'a Plan,
    all_targets: &'a [TargetId],
    target: TargetId,
    config: SessionConfig,
    cancel: CancelToken,
    state: SessionState,
    report: SessionReport,
    current_sector: Option<u16>,
    current_chunk: Option<u32>,
}

impl<'a, T: Transport, H: ContextHooks> Session<'a, T, H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bootloader: &'a mut Bootloader<T>,
        hooks: &'a mut H,
        descriptor: &'a McuDescriptor,
        plan: &'a Plan,
        all_targets: &'a [TargetId],
        target: TargetId,
        config: SessionConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bootloader,
            hooks,
            descriptor,
            plan,
            all_targets,
            target,
            config,
            cancel,
            state: SessionState::Idle,
            report: SessionReport::default(),
            current_sector: None,
            current_chunk: None,
        }
    }

    /// Runs the session to completion.
    pub fn run(mut self) -> TargetOutcome {
        info!("programming target {}", self.target);

        if let Err(e) = self.hooks.be_quiet(self.all_targets) {
            return self.fail(Error::Hook(format!("be_quiet: {e:#}")));
        }
        self.set_state(SessionState::Silenced);

        loop {
            match self.attempt() {
                Ok(()) => {
                    self.set_state(SessionState::Done);
                    info!(
                        "target {} done: {} erases, {} writes",
                        self.target, self.report.erases, self.report.writes
                    );
                    return TargetOutcome::Done(self.report);
                }
                Err(e)
                    if e.is_transient()
                        && !matches!(e, Error::TransportClosed(_))
                        && self.report.restarts < self.config.limits.session_restart =>
                {
                    self.report.restarts += 1;
                    warn!(
                        "target {}: {e}; restarting session ({}/{})",
                        self.target, self.report.restarts, self.config.limits.session_restart
                    );
                }
                Err(e) => return self.fail(e),
            }
        }
    }

    /// One bootloader entry: handshake, identify, program every dirty
    /// sector, optionally jump.
    fn attempt(&mut self) -> Result<()> {
        self.check_cancel()?;
        self.current_sector = None;
        self.current_chunk = None;

        self.hooks
            .enter_bootloader(self.target)
            .map_err(|e| Error::Hook(format!("enter_bootloader: {e:#}")))?;
        self.set_state(SessionState::BootloaderEntered);

        // Anything still buffered belongs to an earlier conversation.
        let _ = self.bootloader.drain();
        self.bootloader.sync()?;
        self.set_state(SessionState::Handshaked);

        let get_info = self.bootloader.get()?;
        self.report.bootloader_version = Some(get_info.version);
        let pid = self.bootloader.get_id()?;
        let resolved = McuDescriptor::for_pid(pid).ok_or(Error::UnsupportedDevice(pid))?;
        if resolved.pid != self.descriptor.pid {
            warn!(
                "device identifies as {} but the plan targets {}",
                resolved.family, self.descriptor.family
            );
            return Err(Error::UnsupportedDevice(pid));
        }
        let erase_kind = get_info.erase_kind()?;
        if self.descriptor.extended_erase && erase_kind != EraseKind::Extended {
            warn!(
                "descriptor expects extended erase but device offers the standard command"
            );
        }
        self.set_state(SessionState::Identified);
        info!(
            "target {}: {} bootloader v{}",
            self.target, self.descriptor.family, get_info.version
        );

        for sector in self.plan.dirty_sectors() {
            self.check_cancel()?;
            self.program_sector(sector, erase_kind)?;
        }

        if self.config.go_after {
            self.check_cancel()?;
            self.bootloader.go(self.descriptor.flash_lo)?;
        }
        Ok(())
    }

    /// Erases and programs one sector, re-erasing and restarting it from
    /// the first chunk when a chunk exhausts its own budget.
    fn program_sector(&mut self, sector: u16, erase_kind: EraseKind) -> Result<()> {
        self.current_sector = Some(sector);
        let mut recovery_passes = 0;
        loop {
            self.erase_sector(sector, erase_kind)?;
            match self.write_sector(sector) {
                Ok(()) => {
                    self.current_sector = None;
                    return Ok(());
                }
                Err(e) if e.consumes_attempt() => {
                    if recovery_passes >= self.config.limits.sector_recover {
                        warn!("sector {sector}: recovery budget exhausted ({e})");
                        return Err(Error::SectorUnrecoverable(sector));
                    }
                    recovery_passes += 1;
                    warn!(
                        "sector {sector}: {e}; re-erasing and rewriting ({}/{})",
                        recovery_passes, self.config.limits.sector_recover
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Erases `sector` and verifies its first and last page are blank,
    /// within the erase budget.
    fn erase_sector(&mut self, sector: u16, erase_kind: EraseKind) -> Result<()> {
        let mut last = None;
        for attempt in 1..=self.config.limits.erase {
            self.check_cancel()?;
            self.set_state(SessionState::Erasing(sector));
            let result = self.try_erase(sector, erase_kind);
            self.report.erases += 1;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.consumes_attempt() => {
                    warn!(
                        "sector {sector}: erase attempt {attempt}/{} failed: {e}",
                        self.config.limits.erase
                    );
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let cause = last.unwrap_or(Error::EraseCheckFailed(sector));
        warn!("sector {sector}: erase budget exhausted ({cause})");
        Err(Error::SectorUnrecoverable(sector))
    }

    fn try_erase(&mut self, sector: u16, erase_kind: EraseKind) -> Result<()> {
        self.bootloader.erase_sector(sector, erase_kind)?;
        self.blank_check(sector)
    }

    /// Reads the first and the last page of the sector and checks the
    /// erased pattern.
    fn blank_check(&mut self, sector: u16) -> Result<()> {
        let page_size = self.descriptor.page_size;
        let descriptor_sector = self
            .descriptor
            .sectors
            .get(sector as usize)
            .ok_or_else(|| Error::Plan(format!("unknown sector {sector}")))?;
        let first = descriptor_sector.start;
        let last = descriptor_sector.end() - page_size as u32;
        let mut buf = vec![0u8; page_size];
        for page_addr in [first, last] {
            self.bootloader.read_memory(page_addr, &mut buf)?;
            if buf.iter().any(|b| *b != PAD_BYTE) {
                debug!("sector {sector}: page at 0x{page_addr:08X} not blank");
                return Err(Error::EraseCheckFailed(sector));
            }
            if first == last {
                break;
            }
        }
        Ok(())
    }

    /// Writes and verifies every chunk of one sector in order.
    fn write_sector(&mut self, sector: u16) -> Result<()> {
        let plan = self.plan;
        for (index, chunk) in plan.chunks_in_sector(sector).enumerate() {
            self.check_cancel()?;
            self.write_chunk(index, chunk)?;
        }
        Ok(())
    }

    /// Writes one chunk and verifies it by read-back, within the chunk
    /// budget.  The exhausted budget propagates the last failure so the
    /// sector loop can decide on recovery.
    fn write_chunk(&mut self, index: usize, chunk: &Chunk) -> Result<()> {
        self.current_chunk = Some(chunk.address);
        let mut last = None;
        for attempt in 1..=self.config.limits.chunk {
            self.check_cancel()?;
            self.set_state(SessionState::Writing {
                chunk: index,
                attempt,
            });
            match self.try_write_chunk(chunk) {
                Ok(()) => {
                    self.current_chunk = None;
                    return Ok(());
                }
                Err(e) if e.consumes_attempt() => {
                    warn!(
                        "chunk at 0x{:08X}: attempt {attempt}/{} failed: {e}",
                        chunk.address, self.config.limits.chunk
                    );
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(Error::VerifyMismatch {
            address: chunk.address,
            offset: 0,
            expected: 0,
            actual: 0,
        }))
    }

    fn try_write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let write = self.bootloader.write_memory(chunk.address, &chunk.bytes);
        self.report.writes += 1;
        write?;

        let mut readback = vec![0u8; chunk.bytes.len()];
        self.bootloader.read_memory(chunk.address, &mut readback)?;
        for (offset, (expected, actual)) in chunk.bytes.iter().zip(readback.iter()).enumerate() {
            if expected != actual {
                return Err(Error::VerifyMismatch {
                    address: chunk.address,
                    offset,
                    expected: *expected,
                    actual: *actual,
                });
            }
        }
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("target {}: {:?} -> {:?}", self.target, self.state, state);
        self.state = state;
    }

    fn fail(mut self, error: Error) -> TargetOutcome {
        self.set_state(SessionState::Failed);
        warn!("target {} failed: {error}", self.target);
        TargetOutcome::Failed(TargetFailure {
            error,
            sector: self.current_sector,
            chunk_address: self.current_chunk,
            report: self.report,
        })
    }
}
