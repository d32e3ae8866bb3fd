//! 統合テスト用の偽物（メモリ、トラップソース、オブザーバ）

#![allow(dead_code)]

use kanshi_core::{AccessEntry, EngineConfig, ManualScheduler, SessionObserver, SessionStats, WatchEngine};
use kanshi_target::{
    ArmFailure, EndReason, InterceptionMode, ModuleInfo, ProcessMemory, ThreadId, TrapHandler,
    TrapSource, WatchSpec,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// 監視対象のアドレス
pub const WATCH_ADDR: u64 = 0x404010;

/// mov dword ptr [rip + 0x300a], eax （監視範囲への書き込み）
pub const X: u64 = 0x401000;
/// cmp dword ptr [rip + 0x2fe9], 0 （監視範囲との比較）
pub const Y: u64 = 0x401020;
/// add dword ptr [rax + 8], 1 （レジスタ依存のオペランド）
pub const Z: u64 = 0x401040;
/// mov dword ptr [rip + 0x30aa], eax （同じページの別の変数）
pub const N: u64 = 0x401060;
/// add dword ptr [rip + 0x2f89], 1
pub const A: u64 = 0x401080;
/// mov eax, dword ptr [rip + 0x2f6a] （監視範囲からの読み込み）
pub const L: u64 = 0x4010a0;

/// 区間ごとのバイト列を持つメモリ
pub struct FakeMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            regions: vec![
                (X, vec![0x89, 0x05, 0x0a, 0x30, 0x00, 0x00]),
                (Y, vec![0x83, 0x3d, 0xe9, 0x2f, 0x00, 0x00, 0x00]),
                (Z, vec![0x83, 0x40, 0x08, 0x01]),
                (N, vec![0x89, 0x05, 0xaa, 0x30, 0x00, 0x00]),
                (A, vec![0x83, 0x05, 0x89, 0x2f, 0x00, 0x00, 0x01]),
                (L, vec![0x8b, 0x05, 0x6a, 0x2f, 0x00, 0x00]),
            ],
        }
    }
}

impl ProcessMemory for FakeMemory {
    fn read_bytes(&self, address: u64, length: usize) -> kanshi_target::Result<Vec<u8>> {
        for (base, bytes) in &self.regions {
            let end = base + bytes.len() as u64;
            if (*base..end).contains(&address) {
                let start = (address - base) as usize;
                let stop = (start + length).min(bytes.len());
                return Ok(bytes[start..stop].to_vec());
            }
        }
        Err(anyhow::anyhow!("Failed to read memory at 0x{:x}", address))
    }

    fn owning_module(&self, address: u64) -> Option<ModuleInfo> {
        (0x400000..0x500000).contains(&address).then(|| ModuleInfo {
            name: "target".to_string(),
            base: 0x400000,
            size: 0x100000,
        })
    }

    fn is_64bit(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct SourceState {
    handler: Option<Arc<dyn TrapHandler>>,
    mode: Option<InterceptionMode>,
    delivered: u64,
    calls: Vec<&'static str>,
}

/// テストからトラップを注入するためのハンドル
#[derive(Clone, Default)]
pub struct Injector {
    state: Arc<Mutex<SourceState>>,
}

impl Injector {
    /// 監視中ならトラップを1回通知する。通知したら `true`
    pub fn trap(&self, address: u64, thread_id: ThreadId) -> bool {
        let mut state = self.state.lock();
        let Some(handler) = state.handler.clone() else {
            return false;
        };
        state.delivered += 1;
        handler.on_trap(address, thread_id);
        true
    }

    pub fn traps(&self, address: u64, count: usize) {
        for _ in 0..count {
            self.trap(address, 1);
        }
    }

    /// 対象の喪失を通知する（ハンドラは残る）
    pub fn lose_target(&self, reason: EndReason) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler.on_session_ended(reason);
        }
    }

    /// 通知なしで監視が外れた状態にする
    pub fn disarm(&self) {
        self.state.lock().handler = None;
    }

    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn mode(&self) -> Option<InterceptionMode> {
        self.state.lock().mode
    }
}

/// 応答を台本で決めたトラップソース
pub struct ScriptedTrapSource {
    page_guard: Result<(), ArmFailure>,
    hardware: Result<(), ArmFailure>,
    injector: Injector,
    last_failure: Option<String>,
}

impl ScriptedTrapSource {
    pub fn new(page_guard: Result<(), ArmFailure>, hardware: Result<(), ArmFailure>) -> Self {
        Self {
            page_guard,
            hardware,
            injector: Injector::default(),
            last_failure: None,
        }
    }

    pub fn working() -> Self {
        Self::new(Ok(()), Ok(()))
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    fn arm(
        &mut self,
        mode: InterceptionMode,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure> {
        let outcome = match mode {
            InterceptionMode::PageGuard => self.page_guard.clone(),
            InterceptionMode::HardwareBreakpoint => self.hardware.clone(),
        };
        let mut state = self.injector.state.lock();
        state.calls.push(match mode {
            InterceptionMode::PageGuard => "page_guard",
            InterceptionMode::HardwareBreakpoint => "hardware",
        });
        match outcome {
            Ok(()) => {
                state.handler = Some(handler);
                state.mode = Some(mode);
                Ok(())
            }
            Err(failure) => {
                self.last_failure = Some(failure.to_string());
                Err(failure)
            }
        }
    }
}

impl TrapSource for ScriptedTrapSource {
    fn start_page_guard(
        &mut self,
        _spec: &WatchSpec,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure> {
        self.arm(InterceptionMode::PageGuard, handler)
    }

    fn start_hardware_breakpoint(
        &mut self,
        _spec: &WatchSpec,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure> {
        self.arm(InterceptionMode::HardwareBreakpoint, handler)
    }

    fn stop(&mut self) {
        let mut state = self.injector.state.lock();
        state.calls.push("stop");
        state.handler = None;
        state.mode = None;
    }

    fn hit_count(&self) -> u64 {
        self.injector.delivered()
    }

    fn is_armed(&self) -> bool {
        self.injector.state.lock().handler.is_some()
    }

    fn active_mode(&self) -> Option<InterceptionMode> {
        self.injector.mode()
    }

    fn last_failure_reason(&self) -> Option<String> {
        self.last_failure.clone()
    }
}

/// 通知を記録するオブザーバ
#[derive(Default)]
pub struct RecordingObserver {
    pub renders: Mutex<Vec<(Vec<AccessEntry>, SessionStats)>>,
    pub offers: Mutex<Vec<Duration>>,
    pub escalations: Mutex<Vec<InterceptionMode>>,
    pub endings: Mutex<Vec<EndReason>>,
}

impl RecordingObserver {
    pub fn render_count(&self) -> usize {
        self.renders.lock().len()
    }

    pub fn last_render(&self) -> Option<(Vec<AccessEntry>, SessionStats)> {
        self.renders.lock().last().cloned()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_render(&self, entries: &[AccessEntry], stats: &SessionStats) {
        self.renders.lock().push((entries.to_vec(), *stats));
    }

    fn on_escalation_offered(&self, silent_for: Duration) {
        self.offers.lock().push(silent_for);
    }

    fn on_escalated(&self, mode: InterceptionMode) {
        self.escalations.lock().push(mode);
    }

    fn on_session_ended(&self, reason: &EndReason) {
        self.endings.lock().push(reason.clone());
    }
}

/// テスト用に組み立てたエンジン
pub struct Harness {
    pub engine: WatchEngine,
    pub injector: Injector,
    pub scheduler: Arc<ManualScheduler>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn with_source(source: ScriptedTrapSource) -> Self {
        let injector = source.injector();
        let scheduler = Arc::new(ManualScheduler::new());
        let observer = Arc::new(RecordingObserver::default());
        let engine = WatchEngine::with_scheduler(
            Arc::new(FakeMemory::new()),
            Box::new(source),
            EngineConfig::default(),
            scheduler.clone(),
        );
        engine.set_observer(observer.clone());
        Self {
            engine,
            injector,
            scheduler,
            observer,
        }
    }

    pub fn new() -> Self {
        Self::with_source(ScriptedTrapSource::working())
    }
}

/// 監視範囲 [WATCH_ADDR, WATCH_ADDR + 4)
pub fn watch(write_only: bool) -> WatchSpec {
    WatchSpec::new(WATCH_ADDR, 4, write_only).unwrap()
}

/// スナップショットを (アドレス, 回数) の列にする
pub fn counts(entries: &[AccessEntry]) -> Vec<(u64, u64)> {
    entries
        .iter()
        .map(|e| (e.instruction_address, e.count))
        .collect()
}
