use crate::clock::remote::{fetch_trade_calendar, sync_service_time, SyncOutcome};
use crate::clock::session::classify;
use crate::clock::session::SessionVerdict;
use crate::clock::types::{
    ClockConfig, DriverState, StartClockArgs, SyncSource, TradingCalendar, WindowSignal,
};
use crate::clock::{DISPLAY_TIME_FORMAT, TICK_INTERVAL_MS};
use crate::error::ClockError;
use crate::state::{SessionSink, SessionSnapshot, SessionStore};
use chrono::{Local, NaiveDateTime, TimeZone};
use parking_lot::Mutex;
use reqwest::Client;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug)]
struct ClockState {
    timestamp_ms: Option<i64>,
    display_time: Option<String>,
}

struct FrameDriver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared between the two drivers and the handle. The virtual
/// timestamp has one writer at a time: the frame driver while it is active,
/// the backup driver otherwise, sync adoption in either case behind the same
/// lock.
struct ClockShared {
    config: ClockConfig,
    http_client: Client,
    calendar: TradingCalendar,
    clock: Mutex<ClockState>,
    frame_active: AtomicBool,
    frame_driver: Mutex<Option<FrameDriver>>,
    driver_state: Mutex<DriverState>,
    session_store: SessionStore,
    sink: Option<Arc<dyn SessionSink>>,
    cancel: CancellationToken,
}

/// Outcome of the backup driver's pre-tick drift check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickPlan {
    Advance { next_ms: i64 },
    Recalibrate { rebased_ms: i64, deviation_ms: i64 },
}

fn plan_backup_tick(current_ms: i64, system_now_ms: i64, drift_limit_ms: i64) -> TickPlan {
    let expected_next_ms = current_ms.saturating_add(TICK_INTERVAL_MS);
    let deviation_ms = signed_time_delta_ms(system_now_ms, expected_next_ms);
    if deviation_ms.abs() > drift_limit_ms {
        // Rebase one tick behind the system clock so the +1000 advance lands
        // exactly on it.
        TickPlan::Recalibrate {
            rebased_ms: system_now_ms - TICK_INTERVAL_MS,
            deviation_ms,
        }
    } else {
        TickPlan::Advance {
            next_ms: expected_next_ms,
        }
    }
}

/// Accumulates monotonic elapsed time across frame polls and grants one tick
/// per full second, rebasing by the remainder so frame-rate variance never
/// skews tick spacing.
#[derive(Debug, Default)]
struct FramePacer {
    last_mark_ms: Option<u64>,
}

impl FramePacer {
    fn on_frame(&mut self, now_ms: u64) -> bool {
        let tick_ms = TICK_INTERVAL_MS as u64;
        let Some(mark) = self.last_mark_ms else {
            self.last_mark_ms = Some(now_ms);
            return false;
        };
        let elapsed = now_ms.saturating_sub(mark);
        if elapsed >= tick_ms {
            self.last_mark_ms = Some(now_ms - (elapsed % tick_ms));
            true
        } else {
            false
        }
    }
}

/// Commits one tick: +1000 ms on the virtual clock (with the backup driver's
/// drift check when `backup_now_ms` is given), then display formatting and a
/// classifier pass. Publish failures never unwind into the driver loops.
fn commit_tick(shared: &ClockShared, backup_now_ms: Option<i64>) {
    let advanced = {
        let mut clock = shared.clock.lock();
        let Some(current) = clock.timestamp_ms else {
            return;
        };
        let next = match backup_now_ms {
            Some(system_now_ms) => {
                match plan_backup_tick(current, system_now_ms, shared.config.drift_limit_ms) {
                    TickPlan::Advance { next_ms } => next_ms,
                    TickPlan::Recalibrate {
                        rebased_ms,
                        deviation_ms,
                    } => {
                        info!(
                            "virtual clock drifted {deviation_ms} ms, recalibrating to the system clock"
                        );
                        rebased_ms + TICK_INTERVAL_MS
                    }
                }
            }
            None => current + TICK_INTERVAL_MS,
        };
        clock.timestamp_ms = Some(next);
        next
    };

    publish_instant(shared, advanced);
}

/// Re-formats the display time and runs one classifier pass for
/// `timestamp_ms`. On an unrepresentable local instant the previous display
/// value is kept and the failure is only logged.
fn publish_instant(shared: &ClockShared, timestamp_ms: i64) {
    let Some(now) = local_naive(timestamp_ms) else {
        warn!(
            "timestamp {timestamp_ms} is not representable as local time, keeping previous display value"
        );
        return;
    };

    {
        let mut clock = shared.clock.lock();
        clock.display_time = Some(now.format(DISPLAY_TIME_FORMAT).to_string());
    }

    if shared.config.session_tracking {
        let verdict = classify(now, &shared.calendar);
        deliver_verdict(shared, &verdict);
    }
}

fn deliver_verdict(shared: &ClockShared, verdict: &SessionVerdict) {
    notify_sink(&shared.session_store, verdict);

    if let Some(sink) = &shared.sink {
        let delivery = catch_unwind(AssertUnwindSafe(|| notify_sink(sink.as_ref(), verdict)));
        if delivery.is_err() {
            warn!("session sink panicked during delivery, tick loop continues");
        }
    }
}

fn notify_sink(sink: &dyn SessionSink, verdict: &SessionVerdict) {
    sink.set_status(verdict.status);
    if let Some(date) = verdict.nearest_trading_date {
        sink.set_nearest_trading_date(date);
    }
    if let Some(close) = verdict.last_session_close {
        sink.set_last_session_close_time(close);
    }
}

fn local_naive(timestamp_ms: i64) -> Option<NaiveDateTime> {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .earliest()
        .map(|instant| instant.naive_local())
}

async fn run_frame_driver(shared: Arc<ClockShared>, cancel: CancellationToken) {
    let started_at = Instant::now();
    let mut pacer = FramePacer::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.config.frame_poll_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let elapsed_ms = started_at.elapsed().as_millis().min(u64::MAX as u128) as u64;
                if pacer.on_frame(elapsed_ms) {
                    commit_tick(&shared, None);
                }
            }
        }
    }
}

async fn run_backup_driver(shared: Arc<ClockShared>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.frame_active.load(Ordering::SeqCst) {
                    continue;
                }
                commit_tick(&shared, Some(now_unix_ms()));
            }
        }
    }
}

/// Idempotent: returns false when a frame driver is already outstanding or
/// the engine is disposed.
fn start_frame_driver(shared: &Arc<ClockShared>) -> bool {
    if shared.cancel.is_cancelled() {
        return false;
    }
    let mut slot = shared.frame_driver.lock();
    if slot.is_some() {
        return false;
    }

    let cancel = shared.cancel.child_token();
    shared.frame_active.store(true, Ordering::SeqCst);
    *shared.driver_state.lock() = DriverState::Active;
    let task = tokio::spawn(run_frame_driver(Arc::clone(shared), cancel.clone()));
    *slot = Some(FrameDriver { cancel, task });
    true
}

/// Fetches the authoritative time and the trading calendar, then launches
/// the engine. A failed calendar fetch is logged and replaced by an empty
/// calendar; the engine still starts.
pub async fn start_clock_engine(
    args: StartClockArgs,
    sink: Option<Arc<dyn SessionSink>>,
) -> Result<ClockEngineHandle, ClockError> {
    let config = args.normalize()?;
    let http_client = Client::builder()
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()?;

    let outcome = sync_service_time(&http_client, &config.base_url).await;

    let calendar = if config.session_tracking {
        match fetch_trade_calendar(&http_client, &config.base_url).await {
            Ok(calendar) => calendar,
            Err(error) => {
                error!("trade calendar load failed, every day will classify as non-trading: {error}");
                TradingCalendar::default()
            }
        }
    } else {
        TradingCalendar::default()
    };

    Ok(launch_clock_engine(
        config,
        http_client,
        outcome.timestamp_ms,
        calendar,
        sink,
    ))
}

/// Fetch-free launch seam: starts both drivers over an already-synced
/// timestamp and an already-loaded calendar. Must run inside a tokio
/// runtime.
pub fn launch_clock_engine(
    config: ClockConfig,
    http_client: Client,
    initial_timestamp_ms: i64,
    calendar: TradingCalendar,
    sink: Option<Arc<dyn SessionSink>>,
) -> ClockEngineHandle {
    let shared = Arc::new(ClockShared {
        config,
        http_client,
        calendar,
        clock: Mutex::new(ClockState {
            timestamp_ms: Some(initial_timestamp_ms),
            display_time: None,
        }),
        frame_active: AtomicBool::new(false),
        frame_driver: Mutex::new(None),
        driver_state: Mutex::new(DriverState::Stopped),
        session_store: SessionStore::new(),
        sink,
        cancel: CancellationToken::new(),
    });

    // Publish before the first tick so display and session fields are never
    // stale at startup.
    publish_instant(&shared, initial_timestamp_ms);

    start_frame_driver(&shared);
    let backup_task = tokio::spawn(run_backup_driver(Arc::clone(&shared)));

    ClockEngineHandle {
        shared,
        backup_task: Mutex::new(Some(backup_task)),
    }
}

/// Disposer object for a running engine: suspend/resume, resync, signal
/// mapping, polling accessors, teardown.
pub struct ClockEngineHandle {
    shared: Arc<ClockShared>,
    backup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClockEngineHandle {
    pub fn display_time(&self) -> Option<String> {
        self.shared.clock.lock().display_time.clone()
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.shared.clock.lock().timestamp_ms
    }

    pub fn driver_state(&self) -> DriverState {
        *self.shared.driver_state.lock()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.shared.session_store.snapshot()
    }

    /// Stops the frame driver; the backup driver keeps covering ticks.
    pub fn suspend(&self) {
        let driver = self.shared.frame_driver.lock().take();
        let Some(driver) = driver else {
            return;
        };
        self.shared.frame_active.store(false, Ordering::SeqCst);
        driver.cancel.cancel();
        // The loop exits at its next yield point; no need to wait for it.
        drop(driver.task);
        *self.shared.driver_state.lock() = DriverState::Suspended;
    }

    /// Re-anchors to authoritative time, then restarts the frame driver.
    /// Resumption never compounds local drift: the sync happens first.
    pub async fn resume(&self) -> SyncSource {
        let source = self.resync().await;
        start_frame_driver(&self.shared);
        source
    }

    /// Manual resynchronization entry point.
    pub async fn resync(&self) -> SyncSource {
        let outcome =
            sync_service_time(&self.shared.http_client, &self.shared.config.base_url).await;
        self.adopt_sync(outcome);
        outcome.source
    }

    /// Applies a sync result unless the engine was disposed while the fetch
    /// was in flight. Returns whether the result was adopted.
    fn adopt_sync(&self, outcome: SyncOutcome) -> bool {
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        {
            let mut clock = self.shared.clock.lock();
            clock.timestamp_ms = Some(outcome.timestamp_ms);
        }
        publish_instant(&self.shared, outcome.timestamp_ms);
        true
    }

    /// Maps window/document lifecycle signals onto the state machine: blur
    /// or hidden suspends, focus or shown resyncs and resumes.
    pub async fn apply_signal(&self, signal: WindowSignal) {
        match signal {
            WindowSignal::FocusLost | WindowSignal::VisibilityHidden => self.suspend(),
            WindowSignal::FocusGained | WindowSignal::VisibilityShown => {
                self.resume().await;
            }
        }
    }

    /// Cancels both drivers and waits for them. Idempotent.
    pub async fn dispose(&self) {
        self.shared.cancel.cancel();

        let frame = self.shared.frame_driver.lock().take();
        if let Some(driver) = frame {
            driver.cancel.cancel();
            let _ = driver.task.await;
        }

        let backup = self.backup_task.lock().take();
        if let Some(task) = backup {
            let _ = task.await;
        }

        self.shared.frame_active.store(false, Ordering::SeqCst);
        *self.shared.driver_state.lock() = DriverState::Stopped;
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn signed_time_delta_ms(lhs_ms: i64, rhs_ms: i64) -> i64 {
    let delta = (lhs_ms as i128) - (rhs_ms as i128);
    delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::types::SessionStatus;
    use chrono::NaiveDate;

    fn test_config(base_url: &str, session_tracking: bool) -> ClockConfig {
        StartClockArgs {
            base_url: base_url.to_string(),
            session_tracking: Some(session_tracking),
            ..StartClockArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn launch_for_test(session_tracking: bool, calendar: TradingCalendar) -> ClockEngineHandle {
        launch_clock_engine(
            test_config("http://127.0.0.1:9", session_tracking),
            Client::new(),
            now_unix_ms(),
            calendar,
            None,
        )
    }

    #[test]
    fn advances_when_deviation_is_within_limit() {
        let plan = plan_backup_tick(10_000, 11_500, 30_000);
        assert_eq!(plan, TickPlan::Advance { next_ms: 11_000 });
    }

    #[test]
    fn recalibrates_when_system_clock_ran_ahead() {
        // Suspended long enough that the expected next tick lags real time
        // by more than the limit: rebase to one tick behind the system
        // clock, so the subsequent advance lands exactly on it.
        let plan = plan_backup_tick(10_000, 100_000, 30_000);
        assert_eq!(
            plan,
            TickPlan::Recalibrate {
                rebased_ms: 99_000,
                deviation_ms: 89_000,
            }
        );
        if let TickPlan::Recalibrate { rebased_ms, .. } = plan {
            assert_eq!(rebased_ms + TICK_INTERVAL_MS, 100_000);
        }
    }

    #[test]
    fn recalibrates_when_virtual_clock_ran_ahead() {
        let plan = plan_backup_tick(200_000, 100_000, 30_000);
        assert_eq!(
            plan,
            TickPlan::Recalibrate {
                rebased_ms: 99_000,
                deviation_ms: -101_000,
            }
        );
    }

    #[test]
    fn frame_pacer_commits_once_per_accumulated_second() {
        let mut pacer = FramePacer::default();
        assert!(!pacer.on_frame(0));
        assert!(!pacer.on_frame(999));
        // 1700 ms elapsed: one tick, remainder 700 ms carried forward.
        assert!(pacer.on_frame(1_700));
        assert!(!pacer.on_frame(1_999));
        assert!(pacer.on_frame(2_000));
    }

    #[test]
    fn frame_pacer_first_frame_only_primes() {
        let mut pacer = FramePacer::default();
        assert!(!pacer.on_frame(5_000));
        assert!(pacer.on_frame(6_000));
    }

    #[test]
    fn far_future_timestamp_is_not_representable_locally() {
        assert!(local_naive(i64::MAX).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn frame_driver_advances_the_virtual_clock() {
        let handle = launch_for_test(false, TradingCalendar::default());
        let initial = handle.timestamp_ms().expect("clock is initialized");

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let advanced = handle.timestamp_ms().expect("clock is initialized");
        assert!(advanced >= initial + 3 * TICK_INTERVAL_MS);
        assert_eq!(advanced % 1_000, initial % 1_000);
        assert!(handle.display_time().is_some());
        handle.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn starting_the_frame_driver_twice_is_a_no_op() {
        let handle = launch_for_test(false, TradingCalendar::default());
        assert_eq!(handle.driver_state(), DriverState::Active);
        assert!(!start_frame_driver(&handle.shared));
        handle.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn backup_driver_covers_while_suspended() {
        let handle = launch_for_test(false, TradingCalendar::default());
        handle.suspend();
        assert_eq!(handle.driver_state(), DriverState::Suspended);
        assert!(handle.shared.frame_driver.lock().is_none());

        let before = handle.timestamp_ms().expect("clock is initialized");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let after = handle.timestamp_ms().expect("clock is initialized");

        assert!(after > before);
        handle.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_without_active_frame_driver_is_a_no_op() {
        let handle = launch_for_test(false, TradingCalendar::default());
        handle.suspend();
        handle.suspend();
        assert_eq!(handle.driver_state(), DriverState::Suspended);
        handle.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_both_drivers_and_discards_late_sync() {
        let handle = launch_for_test(false, TradingCalendar::default());
        handle.dispose().await;
        assert_eq!(handle.driver_state(), DriverState::Stopped);

        let before = handle.timestamp_ms();
        let adopted = handle.adopt_sync(SyncOutcome {
            timestamp_ms: 1,
            source: SyncSource::Server,
        });
        assert!(!adopted);
        assert_eq!(handle.timestamp_ms(), before);

        // Idempotent teardown.
        handle.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_publish_records_session_fields() {
        // Empty calendar: whatever the local date is, it classifies as a
        // non-trading day.
        let handle = launch_for_test(true, TradingCalendar::default());
        assert_eq!(
            handle.session().status,
            Some(SessionStatus::ClosedNonTradingDay)
        );
        assert_eq!(handle.session().nearest_trading_date, None);
        handle.dispose().await;
    }

    struct PanickingSink;

    impl SessionSink for PanickingSink {
        fn set_status(&self, _status: SessionStatus) {
            panic!("sink failure");
        }

        fn set_nearest_trading_date(&self, _date: NaiveDate) {}

        fn set_last_session_close_time(&self, _close: NaiveDateTime) {}
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sink_does_not_stop_the_tick_loop() {
        let handle = launch_clock_engine(
            test_config("http://127.0.0.1:9", true),
            Client::new(),
            now_unix_ms(),
            TradingCalendar::default(),
            Some(Arc::new(PanickingSink)),
        );
        let initial = handle.timestamp_ms().expect("clock is initialized");

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let advanced = handle.timestamp_ms().expect("clock is initialized");
        assert!(advanced >= initial + 2 * TICK_INTERVAL_MS);
        // The internal store is notified before the external sink and still
        // has the derived status.
        assert_eq!(
            handle.session().status,
            Some(SessionStatus::ClosedNonTradingDay)
        );
        handle.dispose().await;
    }

    #[tokio::test]
    async fn resync_falls_back_to_the_local_clock_when_unreachable() {
        let handle = launch_for_test(false, TradingCalendar::default());
        let source = handle.resync().await;
        assert_eq!(source, SyncSource::LocalFallback);

        let adopted = handle.timestamp_ms().expect("clock is initialized");
        assert!((adopted - now_unix_ms()).abs() < 5_000);
        handle.dispose().await;
    }

    #[tokio::test]
    async fn blur_signal_suspends_and_focus_signal_resumes() {
        let handle = launch_for_test(false, TradingCalendar::default());

        handle.apply_signal(WindowSignal::FocusLost).await;
        assert_eq!(handle.driver_state(), DriverState::Suspended);

        handle.apply_signal(WindowSignal::FocusGained).await;
        assert_eq!(handle.driver_state(), DriverState::Active);
        assert!(handle.shared.frame_driver.lock().is_some());

        handle.dispose().await;
    }
}
