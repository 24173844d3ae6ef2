use crate::config::IntegrityConfig;
use crate::context::Context;
use crate::error::Error;
use crate::platform::{Board, Platform, SecurityEngine};
#[cfg(feature = "defmt")]
use defmt::{error, trace};

/// Runtime check of the critical code region against a reference digest. Scheduling is left
/// to the caller, [`IntegrityMonitor::is_due`] helps with that.
#[derive(Debug, Default)]
pub struct IntegrityMonitor {
    running: bool,
    last_run: Option<u32>,
}

impl IntegrityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, config: &IntegrityConfig) {
        self.running = config.enabled;
        self.last_run = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_due(&self, config: &IntegrityConfig, now: u32) -> bool {
        self.running
            && self
                .last_run
                .is_none_or(|last| now.wrapping_sub(last) >= config.interval_ms)
    }

    pub fn check<T: Platform, E: SecurityEngine, B: Board>(
        &mut self,
        ctx: &mut Context<T, E, B>,
    ) -> Result<(), Error> {
        let integrity = ctx.config.integrity;
        self.last_run = Some(ctx.now());

        let address = ctx.config.layout.address(integrity.region.offset);
        let digest = ctx
            .engine
            .digest(address, integrity.region.size)
            .map_err(|e| {
                ctx.last_engine_error = Some(e);
                Error::SignatureFailure(e)
            })?;

        if digest != integrity.reference {
            #[cfg(feature = "defmt")]
            error!("critical region @{:#010x} modified", address);
            return Err(Error::IntegrityViolation);
        }

        #[cfg(feature = "defmt")]
        trace!("integrity check passed");
        Ok(())
    }
}
