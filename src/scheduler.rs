//! Periodic expiry sweep.
//!
//! Pending sanctions past their `end_date` are force-activated; active
//! embargoes past their `embargo_end_date` are released. One failing record
//! never stops the sweep: it is reported and picked up again next round.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::SanctionResult;
use crate::sanction::SanctionState;
use crate::service::SanctionService;
use crate::types::{SanctionId, TimeStamp};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub activated: Vec<SanctionId>,
    pub released: Vec<SanctionId>,
    pub failed: Vec<(SanctionId, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.released.is_empty() && self.failed.is_empty()
    }
}

pub struct ExpiryScheduler {
    service: Arc<SanctionService>,
}

impl ExpiryScheduler {
    pub fn new(service: Arc<SanctionService>) -> Self {
        Self { service }
    }

    pub fn sweep(&self, now: &TimeStamp<Utc>) -> SanctionResult<SweepReport> {
        let (expired, due) = self.service.sweep_candidates(now)?;
        let mut report = SweepReport::default();

        for id in expired {
            match self.service.force_activate(&id, now.clone()) {
                Ok(Some(_)) => report.activated.push(id),
                // decided by someone else since the scan
                Ok(None) => {}
                Err(e) => {
                    warn!(sanction_id = %id, error = %e, "force activation failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        for id in due {
            // an early termination settled above may already have lifted it
            match self.service.load(&id) {
                Ok(embargo) if embargo.state() != SanctionState::Approved || embargo.is_stuck() => {
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(sanction_id = %id, error = %e, "could not reload due embargo");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            }
            match self.service.release_embargo(&id, now.clone()) {
                Ok(_) => report.released.push(id),
                Err(e) => {
                    warn!(sanction_id = %id, error = %e, "embargo release failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                activated = report.activated.len(),
                released = report.released.len(),
                failed = report.failed.len(),
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `period` until `stop` is set. Always sweeps at least once.
    pub fn run(&self, period: StdDuration, stop: &AtomicBool) {
        loop {
            if let Err(e) = self.sweep(&TimeStamp::new()) {
                warn!(error = %e, "expiry sweep aborted");
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(period);
        }
    }
}
