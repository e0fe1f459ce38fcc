// Behavioral Signal Collector
//
// Passively observes a respondent's in-page activity for the lifetime of
// a session and maintains a BehaviorSnapshot:
// 1. Interaction counters (mouse, keyboard, scroll, focus, resize, paste)
// 2. Bounded ring buffers for click timing and mouse-curve history
// 3. Suspicious-pattern tagging (zero-delta moves, implausible speed,
//    rapid clicking, repeated identical keys, uniform cadence)
// 4. Idle-time accounting and activity rate
//
// Snapshots are emitted on a fixed cadence plus one final authoritative
// snapshot at teardown. The collector performs no network I/O; its only
// side effect is invoking the snapshot callback.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Configuration for behavioral collection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Snapshot emission cadence in seconds
    pub snapshot_interval_secs: u64,
    /// Maximum retained mouse-curve samples
    pub curve_capacity: usize,
    /// Maximum retained click timestamps
    pub click_capacity: usize,
    /// Only every Nth mouse-move event is appended to the curve buffer
    pub mouse_sample_stride: u32,
    /// Seconds without any event before time counts as idle
    pub idle_threshold_secs: u64,
    /// Pixel delta per single move event above which movement is implausible
    pub fast_mouse_px_per_event: f64,
    /// Two clicks closer together than this (ms) count as rapid clicking
    pub rapid_click_ms: u64,
    /// Consecutive identical keydowns before tagging a repeated-key run
    pub repeated_key_run: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5,
            curve_capacity: 100,
            click_capacity: 50,
            mouse_sample_stride: 5,
            idle_threshold_secs: 3,
            fast_mouse_px_per_event: 400.0,
            rapid_click_ms: 120,
            repeated_key_run: 10,
        }
    }
}

/// One sampled mouse position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f64,
    pub y: f64,
    /// Milliseconds since session start
    pub timestamp_ms: u64,
}

/// Point-in-time aggregate of a respondent's interaction activity.
///
/// Counters are monotonically non-decreasing until session end; the curve
/// and click buffers hold the most recent N entries only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorSnapshot {
    pub mouse_movements: u64,
    pub keyboard_events: u64,
    /// Most-recent-N click timestamps (ms since session start)
    pub click_pattern: Vec<u64>,
    /// Most-recent-N sampled mouse positions
    pub mouse_curve: Vec<CurvePoint>,
    pub idle_time_secs: u64,
    pub copy_paste_events: u64,
    pub scroll_events: u64,
    pub focus_events: u64,
    pub resize_events: u64,
    /// Deduplicated detection tags, in first-seen order
    pub suspicious_patterns: Vec<String>,
    pub total_time_ms: u64,
    /// (mouse + keyboard) events per elapsed second
    pub activity_rate: f64,
}

/// Space bar key code, the classic held-key automation giveaway
const SPACE_KEY: u32 = 32;

/// Minimum clicks before cadence uniformity is evaluated
const CADENCE_MIN_CLICKS: usize = 5;

/// Minimum curve samples before trajectory linearity is evaluated
const LINEARITY_MIN_POINTS: usize = 10;

struct TrackerState {
    mouse_movements: u64,
    keyboard_events: u64,
    scroll_events: u64,
    focus_events: u64,
    resize_events: u64,
    copy_paste_events: u64,
    idle_time_secs: u64,
    click_pattern: VecDeque<u64>,
    mouse_curve: VecDeque<CurvePoint>,
    suspicious: Vec<String>,
    last_mouse: Option<(f64, f64)>,
    move_seq: u32,
    last_key: Option<u32>,
    key_run: u32,
    last_click_ms: Option<u64>,
    last_activity: Instant,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            mouse_movements: 0,
            keyboard_events: 0,
            scroll_events: 0,
            focus_events: 0,
            resize_events: 0,
            copy_paste_events: 0,
            idle_time_secs: 0,
            click_pattern: VecDeque::new(),
            mouse_curve: VecDeque::new(),
            suspicious: Vec::new(),
            last_mouse: None,
            move_seq: 0,
            last_key: None,
            key_run: 1,
            last_click_ms: None,
            last_activity: Instant::now(),
        }
    }

    fn tag(&mut self, pattern: &str) {
        if !self.suspicious.iter().any(|p| p == pattern) {
            self.suspicious.push(pattern.to_string());
        }
    }
}

type SnapshotCallback = Arc<dyn Fn(BehaviorSnapshot) + Send + Sync>;

/// Passive behavioral tracker for one respondent session.
///
/// Recording methods are invoked from the embedding page's event handlers;
/// there is no concurrent writer within a session, so the internal mutex is
/// uncontended in practice and poisoning is recovered rather than
/// propagated.
pub struct BehaviorCollector {
    config: CollectorConfig,
    state: Arc<Mutex<TrackerState>>,
    started: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    callback: Mutex<Option<SnapshotCallback>>,
    stopped: AtomicBool,
}

impl BehaviorCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TrackerState::new())),
            started: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Record a mouse movement to (x, y).
    pub fn record_mouse_move(&self, x: f64, y: f64) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let now_ms = self.elapsed_ms();
        let config = &self.config;
        let mut state = self.lock_state();
        state.mouse_movements += 1;
        state.last_activity = Instant::now();

        if let Some((px, py)) = state.last_mouse {
            let dx = x - px;
            let dy = y - py;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance == 0.0 {
                state.tag("Zero movement detected");
            } else if distance > config.fast_mouse_px_per_event {
                state.tag("Unusually fast mouse movement");
            }
        }
        state.last_mouse = Some((x, y));

        // Sample every Nth move into the bounded curve buffer
        state.move_seq += 1;
        if state.move_seq % config.mouse_sample_stride.max(1) == 0 {
            if state.mouse_curve.len() >= config.curve_capacity {
                state.mouse_curve.pop_front();
            }
            state.mouse_curve.push_back(CurvePoint {
                x,
                y,
                timestamp_ms: now_ms,
            });
        }
    }

    /// Record a click.
    pub fn record_click(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let now_ms = self.elapsed_ms();
        let config = &self.config;
        let mut state = self.lock_state();
        state.last_activity = Instant::now();

        if let Some(prev) = state.last_click_ms {
            if now_ms.saturating_sub(prev) < config.rapid_click_ms {
                state.tag("Rapid clicking detected");
            }
        }
        state.last_click_ms = Some(now_ms);

        if state.click_pattern.len() >= config.click_capacity {
            state.click_pattern.pop_front();
        }
        state.click_pattern.push_back(now_ms);
    }

    /// Record a keydown by key code.
    pub fn record_key(&self, key_code: u32) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let run_threshold = self.config.repeated_key_run;
        let mut state = self.lock_state();
        state.keyboard_events += 1;
        state.last_activity = Instant::now();

        if state.last_key == Some(key_code) {
            state.key_run += 1;
            if state.key_run >= run_threshold {
                if key_code == SPACE_KEY {
                    state.tag("Repeated space key detected");
                } else {
                    state.tag("Repeated key input detected");
                }
            }
        } else {
            state.last_key = Some(key_code);
            state.key_run = 1;
        }
    }

    /// Record a scroll event.
    pub fn record_scroll(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.lock_state();
        state.scroll_events += 1;
        state.last_activity = Instant::now();
    }

    /// Record a window focus/blur change.
    pub fn record_focus(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.lock_state();
        state.focus_events += 1;
        state.last_activity = Instant::now();
    }

    /// Record a window resize.
    pub fn record_resize(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.lock_state();
        state.resize_events += 1;
        state.last_activity = Instant::now();
    }

    /// Record a copy or paste event.
    pub fn record_copy_paste(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.lock_state();
        state.copy_paste_events += 1;
        state.last_activity = Instant::now();
    }

    /// Produce a point-in-time snapshot of all collected signals.
    pub fn snapshot(&self) -> BehaviorSnapshot {
        let total_time_ms = self.elapsed_ms();
        let mut state = self.lock_state();

        // Derived pattern checks run at snapshot time, not per event
        if state.click_pattern.len() >= CADENCE_MIN_CLICKS
            && uniform_cadence(state.click_pattern.make_contiguous())
        {
            state.tag("Uniform click cadence detected");
        }
        if state.mouse_curve.len() >= LINEARITY_MIN_POINTS
            && linear_trajectory(state.mouse_curve.make_contiguous())
        {
            state.tag("Linear mouse trajectory detected");
        }

        let elapsed_secs = (total_time_ms / 1000).max(1);
        let activity_rate =
            (state.mouse_movements + state.keyboard_events) as f64 / elapsed_secs as f64;

        BehaviorSnapshot {
            mouse_movements: state.mouse_movements,
            keyboard_events: state.keyboard_events,
            click_pattern: state.click_pattern.iter().copied().collect(),
            mouse_curve: state.mouse_curve.iter().copied().collect(),
            idle_time_secs: state.idle_time_secs,
            copy_paste_events: state.copy_paste_events,
            scroll_events: state.scroll_events,
            focus_events: state.focus_events,
            resize_events: state.resize_events,
            suspicious_patterns: state.suspicious.clone(),
            total_time_ms,
            activity_rate,
        }
    }

    /// Begin observation.
    ///
    /// Emits an initial snapshot immediately, then one per configured
    /// cadence until `stop` is called. A separate 1 s tick accrues idle
    /// time whenever the gap since the last event exceeds the idle
    /// threshold.
    pub fn start<F>(self: &Arc<Self>, on_snapshot: F)
    where
        F: Fn(BehaviorSnapshot) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(on_snapshot);
        {
            let mut slot = self
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(callback.clone());
        }

        callback(self.snapshot());

        let cadence = Duration::from_secs(self.config.snapshot_interval_secs.max(1));
        let snap_collector = Arc::clone(self);
        let snap_callback = callback.clone();
        let snapshot_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.tick().await; // first tick fires immediately; already emitted
            loop {
                interval.tick().await;
                snap_callback(snap_collector.snapshot());
            }
        });

        let idle_threshold = Duration::from_secs(self.config.idle_threshold_secs);
        let idle_state = Arc::clone(&self.state);
        let idle_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut state = idle_state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.last_activity.elapsed() > idle_threshold {
                    state.idle_time_secs += 1;
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(snapshot_task);
        tasks.push(idle_task);
    }

    /// Stop observation and deliver one final, fully up-to-date snapshot.
    ///
    /// The returned snapshot is authoritative; callers must not rely on
    /// the periodic cadence having captured the last events of a session.
    pub fn stop(&self) -> BehaviorSnapshot {
        let already = self.stopped.swap(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        let snapshot = self.snapshot();
        if !already {
            let slot = self
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(callback) = slot.as_ref() {
                callback(snapshot.clone());
            }
        } else {
            debug!("behavior collector stopped twice; final snapshot already delivered");
        }
        snapshot
    }
}

/// True when inter-click intervals are implausibly uniform.
fn uniform_cadence(clicks: &[u64]) -> bool {
    if clicks.len() < CADENCE_MIN_CLICKS {
        return false;
    }
    let intervals: Vec<f64> = clicks
        .windows(2)
        .map(|w| w[1].saturating_sub(w[0]) as f64)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return true;
    }
    let variance = intervals
        .iter()
        .map(|i| (i - mean).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;
    // Coefficient of variation under 5% never happens with human clicking
    variance.sqrt() / mean < 0.05
}

/// True when the sampled curve is almost entirely straight segments.
fn linear_trajectory(curve: &[CurvePoint]) -> bool {
    if curve.len() < LINEARITY_MIN_POINTS {
        return false;
    }
    let mut straight = 0usize;
    let mut total = 0usize;
    let mut prev_direction: Option<f64> = None;
    for pair in curve.windows(2) {
        let dx = pair[1].x - pair[0].x;
        let dy = pair[1].y - pair[0].y;
        if dx == 0.0 && dy == 0.0 {
            continue;
        }
        let direction = dy.atan2(dx);
        if let Some(prev) = prev_direction {
            total += 1;
            if (direction - prev).abs() < std::f64::consts::PI / 36.0 {
                straight += 1;
            }
        }
        prev_direction = Some(direction);
    }
    total >= 5 && straight as f64 / total as f64 > 0.9
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Arc<BehaviorCollector> {
        Arc::new(BehaviorCollector::new(CollectorConfig::default()))
    }

    #[test]
    fn test_counters_accumulate() {
        let c = collector();
        c.record_mouse_move(10.0, 10.0);
        c.record_mouse_move(15.0, 12.0);
        c.record_key(65);
        c.record_scroll();
        c.record_focus();
        c.record_resize();
        c.record_copy_paste();

        let snap = c.snapshot();
        assert_eq!(snap.mouse_movements, 2);
        assert_eq!(snap.keyboard_events, 1);
        assert_eq!(snap.scroll_events, 1);
        assert_eq!(snap.focus_events, 1);
        assert_eq!(snap.resize_events, 1);
        assert_eq!(snap.copy_paste_events, 1);
    }

    #[test]
    fn test_zero_movement_tagged() {
        let c = collector();
        c.record_mouse_move(50.0, 50.0);
        c.record_mouse_move(50.0, 50.0);
        let snap = c.snapshot();
        assert!(snap
            .suspicious_patterns
            .iter()
            .any(|p| p == "Zero movement detected"));
    }

    #[test]
    fn test_fast_movement_tagged() {
        let c = collector();
        c.record_mouse_move(0.0, 0.0);
        c.record_mouse_move(1000.0, 1000.0);
        let snap = c.snapshot();
        assert!(snap
            .suspicious_patterns
            .iter()
            .any(|p| p == "Unusually fast mouse movement"));
    }

    #[test]
    fn test_rapid_clicking_tagged() {
        let c = collector();
        c.record_click();
        c.record_click(); // within the rapid threshold on any realistic machine
        let snap = c.snapshot();
        assert!(snap
            .suspicious_patterns
            .iter()
            .any(|p| p == "Rapid clicking detected"));
    }

    #[test]
    fn test_repeated_space_key_tagged() {
        let c = collector();
        for _ in 0..12 {
            c.record_key(SPACE_KEY);
        }
        let snap = c.snapshot();
        assert!(snap
            .suspicious_patterns
            .iter()
            .any(|p| p == "Repeated space key detected"));
    }

    #[test]
    fn test_alternating_keys_not_tagged() {
        let c = collector();
        for i in 0..30 {
            c.record_key(65 + (i % 2));
        }
        let snap = c.snapshot();
        assert!(!snap
            .suspicious_patterns
            .iter()
            .any(|p| p.starts_with("Repeated")));
    }

    #[test]
    fn test_curve_buffer_bounded_keeps_most_recent() {
        let config = CollectorConfig {
            mouse_sample_stride: 1,
            curve_capacity: 100,
            ..CollectorConfig::default()
        };
        let c = Arc::new(BehaviorCollector::new(config));
        for i in 0..1000 {
            c.record_mouse_move(i as f64, (i * 2) as f64);
        }
        let snap = c.snapshot();
        assert_eq!(snap.mouse_curve.len(), 100);
        // Most recent sample, not the oldest, must be retained
        assert_eq!(snap.mouse_curve.last().map(|p| p.x), Some(999.0));
        assert_eq!(snap.mouse_curve.first().map(|p| p.x), Some(900.0));
        // Counter still reflects every event
        assert_eq!(snap.mouse_movements, 1000);
    }

    #[test]
    fn test_click_buffer_bounded() {
        let c = collector();
        for _ in 0..200 {
            c.record_click();
        }
        let snap = c.snapshot();
        assert_eq!(snap.click_pattern.len(), c.config.click_capacity);
    }

    #[test]
    fn test_sampling_stride() {
        let c = collector(); // stride 5
        for i in 0..20 {
            c.record_mouse_move(i as f64 * 3.0, i as f64 * 7.0);
        }
        let snap = c.snapshot();
        assert_eq!(snap.mouse_curve.len(), 4);
    }

    #[test]
    fn test_suspicious_patterns_deduplicated() {
        let c = collector();
        for _ in 0..5 {
            c.record_mouse_move(10.0, 10.0);
        }
        let snap = c.snapshot();
        let zero_tags = snap
            .suspicious_patterns
            .iter()
            .filter(|p| *p == "Zero movement detected")
            .count();
        assert_eq!(zero_tags, 1);
    }

    #[test]
    fn test_uniform_cadence_detection() {
        let robotic: Vec<u64> = (0..10).map(|i| i * 100).collect();
        assert!(uniform_cadence(&robotic));

        let human = vec![0, 230, 610, 1390, 1820, 2940, 3105];
        assert!(!uniform_cadence(&human));
    }

    #[test]
    fn test_linear_trajectory_detection() {
        let straight: Vec<CurvePoint> = (0..20)
            .map(|i| CurvePoint {
                x: i as f64 * 10.0,
                y: i as f64 * 5.0,
                timestamp_ms: i as u64 * 50,
            })
            .collect();
        assert!(linear_trajectory(&straight));

        let curved: Vec<CurvePoint> = (0..20)
            .map(|i| {
                let t = i as f64 * 0.4;
                CurvePoint {
                    x: 100.0 + t.cos() * 50.0 + (i as f64 * 7.0).sin() * 9.0,
                    y: 100.0 + t.sin() * 50.0 + (i as f64 * 11.0).cos() * 9.0,
                    timestamp_ms: i as u64 * 50,
                }
            })
            .collect();
        assert!(!linear_trajectory(&curved));
    }

    #[tokio::test]
    async fn test_start_emits_immediate_and_final_snapshot() {
        use std::sync::atomic::AtomicUsize;

        let c = collector();
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&emitted);
        c.start(move |_snap| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(emitted.load(Ordering::SeqCst), 1, "initial snapshot");

        c.record_mouse_move(5.0, 5.0);
        c.record_key(65);

        let final_snap = c.stop();
        assert_eq!(emitted.load(Ordering::SeqCst), 2, "final snapshot");
        assert_eq!(final_snap.mouse_movements, 1);
        assert_eq!(final_snap.keyboard_events, 1);
    }

    #[tokio::test]
    async fn test_events_after_stop_ignored() {
        let c = collector();
        c.start(|_| {});
        c.record_key(65);
        c.stop();
        c.record_key(65);
        c.record_mouse_move(1.0, 1.0);
        assert_eq!(c.snapshot().keyboard_events, 1);
        assert_eq!(c.snapshot().mouse_movements, 0);
    }
}
