//! 監視セッションの制御
//!
//! [`WatchEngine`] は表示層に公開される窓口です。トラップソースの
//! 設定と方式の切り替え、集約テーブル、表示の間引き、ウォッチドッグを
//! 1つのセッションとしてまとめます。
//!
//! ロックの規則:
//! - 状態ロックを保持したままトラップソースを呼ばない
//! - トラップソースからの通知の中ではトラップソースのロックを取らない
//! - 周期タスクはキャンセルの合図だけで止め、通知の中から join しない

use crate::aggregator::{AccessEntry, Aggregator};
use crate::classify::FilterPolicy;
use crate::config::EngineConfig;
use crate::errors::{ExportError, WatchError};
use crate::export;
use crate::scheduler::{Scheduler, TaskHandle, ThreadScheduler};
use crate::throttle::PresentationThrottle;
use crate::watchdog::{FallbackPolicy, WatchdogVerdict};
use kanshi_target::{
    ArmFailure, EndReason, InterceptionMode, ProcessMemory, ThreadId, TrapHandler, TrapSource,
    WatchSpec,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Starting,
    Monitoring(InterceptionMode),
    Stopped,
}

impl MonitorState {
    pub fn mode(&self) -> Option<InterceptionMode> {
        match self {
            MonitorState::Monitoring(mode) => Some(*mode),
            _ => None,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self, MonitorState::Monitoring(_))
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Idle => write!(f, "idle"),
            MonitorState::Starting => write!(f, "starting"),
            MonitorState::Monitoring(mode) => write!(f, "monitoring ({})", mode),
            MonitorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// 描画時に渡される集計値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub total_hits: u64,
    pub unique_count: usize,
    pub discarded_hits: u64,
    pub mode: Option<InterceptionMode>,
    pub filter: FilterPolicy,
}

/// 表示層への通知
///
/// 通知はトラップソースやタイマーのスレッドから届きます。
pub trait SessionObserver: Send + Sync {
    /// 間引かれた描画タイミング（最大4Hz、終了時に1回）
    fn on_render(&self, _entries: &[AccessEntry], _stats: &SessionStats) {}

    /// ページガード方式が沈黙しているため、切り替えを提案する
    fn on_escalation_offered(&self, _silent_for: Duration) {}

    /// 監視方式が切り替わった
    fn on_escalated(&self, _mode: InterceptionMode) {}

    /// 対象を見失ってセッションが終了した（1回だけ）
    fn on_session_ended(&self, _reason: &EndReason) {}
}

/// 何もしないオブザーバ
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

struct Session {
    spec: WatchSpec,
    aggregator: Arc<Aggregator>,
    throttle: PresentationThrottle,
    ended: AtomicBool,
}

impl Session {
    fn new(spec: WatchSpec, aggregator: Arc<Aggregator>, shared: Weak<Shared>) -> Self {
        let render_aggregator = Arc::clone(&aggregator);
        let throttle = PresentationThrottle::new(
            Arc::clone(&aggregator),
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.render(&render_aggregator);
                }
            }),
        );
        Self {
            spec,
            aggregator,
            throttle,
            ended: AtomicBool::new(false),
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

struct SessionHandler {
    session: Arc<Session>,
    shared: Weak<Shared>,
}

impl TrapHandler for SessionHandler {
    fn on_trap(&self, instruction_address: u64, thread_id: ThreadId) {
        if self.session.is_ended() {
            return;
        }
        self.session.aggregator.on_trap(instruction_address, thread_id);
    }

    fn on_session_ended(&self, reason: EndReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.target_lost(&self.session, reason);
        }
    }
}

struct Shared {
    memory: Arc<dyn ProcessMemory>,
    source: Mutex<Box<dyn TrapSource>>,
    config: EngineConfig,
    scheduler: Arc<dyn Scheduler>,
    observer: RwLock<Arc<dyn SessionObserver>>,
    state: Mutex<MonitorState>,
    session: RwLock<Option<Arc<Session>>>,
    filter: RwLock<FilterPolicy>,
    watchdog: Mutex<FallbackPolicy>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Shared {
    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    fn observer(&self) -> Arc<dyn SessionObserver> {
        Arc::clone(&self.observer.read())
    }

    fn render(&self, aggregator: &Aggregator) {
        let filter = *self.filter.read();
        let entries = aggregator.snapshot(filter);
        let stats = SessionStats {
            total_hits: aggregator.total_hits(),
            unique_count: aggregator.unique_count(),
            discarded_hits: aggregator.discarded_hits(),
            mode: self.state.lock().mode(),
            filter,
        };
        self.observer().on_render(&entries, &stats);
    }

    fn cancel_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.cancel();
        }
    }

    /// セッションを終了させる。最初の呼び出しだけが `true` を返す
    fn finish(&self, session: &Arc<Session>, next: MonitorState) -> bool {
        if session.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut state = self.state.lock();
            if self.is_current(session) {
                *state = next;
            }
        }
        self.cancel_tasks();
        session.throttle.flush();
        true
    }

    fn target_lost(&self, session: &Arc<Session>, reason: EndReason) {
        if self.finish(session, MonitorState::Stopped) {
            warn!(watch = %session.spec, "Session ended: {}", reason);
            self.observer().on_session_ended(&reason);
        }
    }

    fn watchdog_tick(&self) {
        let Some(mode) = self.state.lock().mode() else {
            return;
        };
        let Some(session) = self.current_session() else {
            return;
        };
        // 設定や切り替えの最中ならこの周期は見送る
        let Some(armed) = self.source.try_lock().map(|source| source.is_armed()) else {
            return;
        };

        let verdict = self
            .watchdog
            .lock()
            .observe(session.aggregator.total_hits(), Some(mode), armed);
        if let WatchdogVerdict::OfferEscalation { silent_for } = verdict {
            info!(
                "No hits for {:?} with {}; offering hardware breakpoints",
                silent_for, mode
            );
            self.observer().on_escalation_offered(silent_for);
        }
    }

    /// 監視を設定する。ページガード方式に失敗したらハードウェア方式に切り替える
    fn arm(
        &self,
        session: &Arc<Session>,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<InterceptionMode, ArmFailure> {
        let mut source = self.source.lock();
        source.stop();

        if self.config.initial_mode == InterceptionMode::PageGuard {
            match source.start_page_guard(&session.spec, Arc::clone(&handler)) {
                Ok(()) => return Ok(InterceptionMode::PageGuard),
                Err(failure) => {
                    warn!("Page guard arm failed ({}); falling back to hardware breakpoints", failure);
                    source.stop();
                }
            }
        }

        match source.start_hardware_breakpoint(&session.spec, handler) {
            Ok(()) => Ok(InterceptionMode::HardwareBreakpoint),
            Err(failure) => {
                warn!("Hardware breakpoint arm failed: {}", failure);
                Err(failure)
            }
        }
    }
}

/// 監視エンジン
pub struct WatchEngine {
    shared: Arc<Shared>,
}

impl WatchEngine {
    /// スレッドのタイマーを使うエンジンを作成する
    pub fn new(
        memory: Arc<dyn ProcessMemory>,
        source: Box<dyn TrapSource>,
        config: EngineConfig,
    ) -> Self {
        Self::with_scheduler(memory, source, config, Arc::new(ThreadScheduler::new()))
    }

    pub fn with_scheduler(
        memory: Arc<dyn ProcessMemory>,
        source: Box<dyn TrapSource>,
        config: EngineConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let watchdog = FallbackPolicy::new(config.escalation_grace, config.watchdog_interval);
        Self {
            shared: Arc::new(Shared {
                memory,
                source: Mutex::new(source),
                config,
                scheduler,
                observer: RwLock::new(Arc::new(NoopObserver)),
                state: Mutex::new(MonitorState::Idle),
                session: RwLock::new(None),
                filter: RwLock::new(FilterPolicy::All),
                watchdog: Mutex::new(watchdog),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.shared.observer.write() = observer;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn handler(&self, session: &Arc<Session>) -> Arc<dyn TrapHandler> {
        Arc::new(SessionHandler {
            session: Arc::clone(session),
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// 監視を開始する
    ///
    /// 設定に失敗した場合は `Idle` に戻り、前回のセッションの結果は残ります。
    pub fn start(&self, spec: WatchSpec) -> Result<InterceptionMode, WatchError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                MonitorState::Idle | MonitorState::Stopped => *state = MonitorState::Starting,
                MonitorState::Starting | MonitorState::Monitoring(_) => {
                    return Err(WatchError::SessionActive)
                }
            }
        }

        let aggregator = Arc::new(Aggregator::new(
            spec,
            Arc::clone(&self.shared.memory),
            self.shared.config.decode_window,
        ));
        let session = Arc::new(Session::new(spec, aggregator, Arc::downgrade(&self.shared)));

        let mode = match self.shared.arm(&session, self.handler(&session)) {
            Ok(mode) => mode,
            Err(failure) => {
                session.ended.store(true, Ordering::Release);
                *self.shared.state.lock() = MonitorState::Idle;
                return Err(WatchError::Arm(failure));
            }
        };

        self.shared.watchdog.lock().reset();
        *self.shared.session.write() = Some(Arc::clone(&session));
        {
            let mut state = self.shared.state.lock();
            *state = if session.is_ended() {
                MonitorState::Stopped
            } else {
                MonitorState::Monitoring(mode)
            };
        }
        self.spawn_tasks(&session);
        info!(watch = %spec, "Monitoring started with {}", mode);

        if mode != self.shared.config.initial_mode {
            self.shared.observer().on_escalated(mode);
        }
        Ok(mode)
    }

    fn spawn_tasks(&self, session: &Arc<Session>) {
        self.shared.cancel_tasks();
        if session.is_ended() {
            return;
        }

        let throttled = Arc::clone(session);
        let refresh = self.shared.scheduler.every(
            self.shared.config.refresh_interval,
            Box::new(move || {
                throttled.throttle.tick();
            }),
        );

        let shared = Arc::downgrade(&self.shared);
        let watchdog = self.shared.scheduler.every(
            self.shared.config.watchdog_interval,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.watchdog_tick();
                }
            }),
        );

        *self.shared.tasks.lock() = vec![refresh, watchdog];
    }

    /// 監視を停止する
    ///
    /// 戻った時点で以降のトラップは集計に反映されません。
    pub fn stop(&self) -> Result<(), WatchError> {
        let session = {
            let state = self.shared.state.lock();
            if !state.is_monitoring() {
                return Err(WatchError::NotMonitoring);
            }
            self.shared.current_session().ok_or(WatchError::NotMonitoring)?
        };

        self.shared.source.lock().stop();
        if self.shared.finish(&session, MonitorState::Stopped) {
            info!(
                watch = %session.spec,
                total_hits = session.aggregator.total_hits(),
                "Monitoring stopped"
            );
        }
        Ok(())
    }

    /// ページガード方式からハードウェア方式へ切り替える
    ///
    /// 集計済みのエントリは引き継がれます。失敗するとセッションは `Idle` に戻ります。
    pub fn escalate_to_hardware(&self) -> Result<(), WatchError> {
        let session = {
            let mut state = self.shared.state.lock();
            match *state {
                MonitorState::Monitoring(InterceptionMode::PageGuard) => {}
                MonitorState::Monitoring(_) => return Err(WatchError::NotPageGuard),
                _ => return Err(WatchError::NotMonitoring),
            }
            let session = self
                .shared
                .current_session()
                .ok_or(WatchError::NotMonitoring)?;
            *state = MonitorState::Starting;
            session
        };

        let handler = self.handler(&session);
        let result = {
            let mut source = self.shared.source.lock();
            source.stop();
            source.start_hardware_breakpoint(&session.spec, handler)
        };

        match result {
            Ok(()) => {
                self.shared.watchdog.lock().reset();
                {
                    let mut state = self.shared.state.lock();
                    if !session.is_ended() {
                        *state = MonitorState::Monitoring(InterceptionMode::HardwareBreakpoint);
                    }
                }
                info!(watch = %session.spec, "Escalated to hardware breakpoints");
                self.shared
                    .observer()
                    .on_escalated(InterceptionMode::HardwareBreakpoint);
                Ok(())
            }
            Err(failure) => {
                warn!("Escalation to hardware breakpoints failed: {}", failure);
                self.shared.finish(&session, MonitorState::Idle);
                Err(WatchError::Arm(failure))
            }
        }
    }

    /// 提案された切り替えを受け入れる
    pub fn accept_escalation(&self) -> Result<(), WatchError> {
        self.shared.watchdog.lock().reset();
        self.escalate_to_hardware()
    }

    /// 提案された切り替えを断る（猶予期間をもう一度待つ）
    pub fn decline_escalation(&self) {
        debug!("Escalation declined");
        self.shared.watchdog.lock().decline();
    }

    /// 切り替えの提案に未応答か
    pub fn escalation_pending(&self) -> bool {
        self.shared.watchdog.lock().offer_pending()
    }

    /// 表示フィルタを変更し、既存のエントリで描き直す
    pub fn set_filter_policy(&self, policy: FilterPolicy) {
        *self.shared.filter.write() = policy;
        if let Some(session) = self.shared.current_session() {
            session.throttle.flush();
        }
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        *self.shared.filter.read()
    }

    /// 現在のフィルタで可視なエントリ
    pub fn snapshot(&self) -> Vec<AccessEntry> {
        match self.shared.current_session() {
            Some(session) => session.aggregator.snapshot(self.filter_policy()),
            None => Vec::new(),
        }
    }

    pub fn total_hits(&self) -> u64 {
        self.shared
            .current_session()
            .map_or(0, |s| s.aggregator.total_hits())
    }

    pub fn unique_count(&self) -> usize {
        self.shared
            .current_session()
            .map_or(0, |s| s.aggregator.unique_count())
    }

    pub fn discarded_hits(&self) -> u64 {
        self.shared
            .current_session()
            .map_or(0, |s| s.aggregator.discarded_hits())
    }

    /// トラップソースが数えた生のトラップ回数
    pub fn raw_hits(&self) -> u64 {
        self.shared.source.lock().hit_count()
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.lock()
    }

    /// 現在（または直前）のセッションの監視対象
    pub fn watch_spec(&self) -> Option<WatchSpec> {
        self.shared.current_session().map(|s| s.spec)
    }

    /// トラップソースが報告した直近の失敗理由
    pub fn last_failure_reason(&self) -> Option<String> {
        self.shared.source.lock().last_failure_reason()
    }

    /// 集計テーブルを消去する
    pub fn reset(&self) {
        if let Some(session) = self.shared.current_session() {
            session.aggregator.reset();
            debug!(watch = %session.spec, "Session table reset");
        }
    }

    /// 現在のフィルタで可視なエントリをファイルに書き出す
    pub fn export_to_text(&self, path: &Path) -> Result<usize, WatchError> {
        if self.shared.current_session().is_none() {
            return Err(ExportError::NoSession.into());
        }
        let entries = self.snapshot();
        export::export_to_text(path, &entries)?;
        info!("Exported {} entries to {}", entries.len(), path.display());
        Ok(entries.len())
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        if self.state().is_monitoring() {
            let _ = self.stop();
        }
        self.shared.cancel_tasks();
    }
}
