//! Scheduler (Component H): a tick loop that fires the fund cycle and the
//! gas check on their configured cadences as independent, concurrently-
//! progressing tasks, each behind its own singleton in-progress guard, and
//! observes shutdown signals to close the RPC provider exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::addressbook::Addressbook;
use crate::config::FundManagerConfig;
use crate::fund::{FundManager, FundState};
use crate::rpc::Chain;
use crate::sig_down::SigDown;

/// Tick cadence of the scheduler's own poll loop; independent of the fund
/// cycle / gas check intervals, which are evaluated against elapsed time on
/// every tick.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Per-process singleton guards preventing overlapping fund cycles or gas
/// checks (spec §5). `Arc`-backed, not plain `AtomicBool`s: the fund cycle
/// and the gas check now run as independently-progressing tasks (spec.md:174
/// "fire the fund cycle asynchronously" / "fire the gas check asynchronously")
/// rather than one awaited to completion before the other is even considered,
/// so a claimed guard must be movable into a spawned task.
#[derive(Clone)]
struct InProgress {
    fund_cycle: Arc<AtomicBool>,
    gas_check: Arc<AtomicBool>,
}

impl InProgress {
    fn new() -> Self {
        Self {
            fund_cycle: Arc::new(AtomicBool::new(false)),
            gas_check: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A guard that clears its flag on drop, so a panicking or early-returning
/// job still releases the singleton (spec invariant 5: `false->true->false`
/// exactly once per cycle). Owns its `Arc<AtomicBool>` so it can be moved
/// into a spawned task rather than borrowing from the scheduler.
struct Guard {
    flag: Arc<AtomicBool>,
}

impl Guard {
    /// Attempts to claim `flag`; returns `None` if it was already held.
    fn try_claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Guard { flag: flag.clone() })
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives ticks against the fund manager, reading/writing the off-chain
/// cadence counters and observing shutdown.
pub struct Scheduler<C> {
    fund: FundManager<C>,
    config: FundManagerConfig,
    state_path: std::path::PathBuf,
    in_progress: InProgress,
}

impl<C: Chain + 'static> Scheduler<C> {
    pub fn new(fund: FundManager<C>, config: FundManagerConfig, state_path: std::path::PathBuf) -> Self {
        Self {
            fund,
            config,
            state_path,
            in_progress: InProgress::new(),
        }
    }

    /// Runs the tick loop until a shutdown signal is observed.
    pub async fn run(&self, book: Arc<Addressbook>, sig_down: &SigDown) {
        info!("scheduler starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    self.tick(&book).await;
                }
                _ = sig_down.recv() => {
                    info!("shutdown signal observed, scheduler exiting");
                    return;
                }
            }
        }
    }

    /// Evaluates both cadences and fires whichever are due as independent,
    /// concurrently-progressing tasks — a fund cycle in flight does not
    /// delay even checking whether a gas check is also due (spec.md:174-175).
    /// The two cannot overlap a shared step regardless (the hot-wallet
    /// top-up step carries its own guard, see `fund::HotGasGuard`).
    async fn tick(&self, book: &Arc<Addressbook>) {
        let state = FundState::load(&self.state_path).await;
        let now = now_ms();

        if now.saturating_sub(state.last_fund_cycle_ms) >= self.config.fund_cycle_interval_ms {
            if let Some(guard) = Guard::try_claim(&self.in_progress.fund_cycle) {
                let fund = self.fund.clone();
                let book = book.clone();
                let state_path = self.state_path.clone();
                tokio::spawn(async move {
                    if let Err(e) = fund.run_cycle(&book).await {
                        warn!(error = %e, "fund cycle aborted before completing any steps");
                    }
                    drop(guard);
                    let mut state = FundState::load(&state_path).await;
                    state.last_fund_cycle_ms = now_ms();
                    if let Err(e) = state.save(&state_path).await {
                        warn!(error = %e, "failed to persist fund-state after fund cycle");
                    }
                });
            }
        }

        if now.saturating_sub(state.last_gas_check_ms) >= self.config.gas_check_interval_ms {
            if let Some(guard) = Guard::try_claim(&self.in_progress.gas_check) {
                let fund = self.fund.clone();
                let book = book.clone();
                let state_path = self.state_path.clone();
                tokio::spawn(async move {
                    if let Err(e) = fund.run_gas_check(&book).await {
                        warn!(error = %e, "gas check aborted before completing");
                    }
                    drop(guard);
                    let mut state = FundState::load(&state_path).await;
                    state.last_gas_check_ms = now_ms();
                    if let Err(e) = state.save(&state_path).await {
                        warn!(error = %e, "failed to persist fund-state after gas check");
                    }
                });
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let _guard = Guard::try_claim(&flag).unwrap();
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_second_claim_is_noop_while_held() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = Guard::try_claim(&flag);
        assert!(first.is_some());
        let second = Guard::try_claim(&flag);
        assert!(second.is_none());
    }
}
