//! トラップの集約
//!
//! トラップソースのスレッドから届くトラップを命令アドレスごとに
//! 重複排除し、ヒット数を数えます。読み取り側はスナップショットの
//! クローンだけを受け取ります。

use crate::classify::{classify, overlaps_watched_range, relevant_for, Classification, FilterPolicy};
use crate::disasm::{decode, DecodeError};
use kanshi_target::{ProcessMemory, ThreadId, WatchSpec};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// 読み取りに失敗した命令の表示
pub const UNREADABLE_TEXT: &str = "<unreadable>";
/// デコードに失敗した命令の表示
pub const INVALID_INSTRUCTION_TEXT: &str = "<invalid instruction>";

/// 命令が属するモジュールと、その中のオフセット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLocation {
    pub name: String,
    pub offset: u64,
}

impl fmt::Display for ModuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+0x{:x}", self.name, self.offset)
    }
}

/// 命令アドレスごとの集計エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub instruction_address: u64,
    pub count: u64,
    pub last_thread_id: ThreadId,
    pub disassembly: String,
    pub module: Option<ModuleLocation>,
    /// 作成時に読み取った命令バイト列（読めなかった場合は空）
    pub bytes: Vec<u8>,
}

impl AccessEntry {
    /// `name+0xoffset` 形式のモジュール表示（不明なら `-`）
    pub fn module_text(&self) -> String {
        match &self.module {
            Some(location) => location.to_string(),
            None => "-".to_string(),
        }
    }
}

/// `on_trap` の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// 監視範囲外として捨てた
    Discarded,
    /// 既存エントリに加算した
    Counted,
    /// 新しいエントリを作成した
    Inserted,
    /// 処理中に `reset` されたため捨てた
    Superseded,
}

/// エントリと、作成時に決めた分類（デコードできなければ `None`）
struct Record {
    entry: AccessEntry,
    class: Option<Classification>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<u64, Record>,
    discarded: HashSet<u64>,
    /// `reset` ごとに進む
    generation: u64,
}

/// トラップの集約テーブル
pub struct Aggregator {
    spec: WatchSpec,
    memory: Arc<dyn ProcessMemory>,
    decode_window: usize,
    is_64bit: bool,
    table: Mutex<Table>,
    total_hits: AtomicU64,
    unique: AtomicUsize,
    discarded_hits: AtomicU64,
    dirty: AtomicBool,
}

impl Aggregator {
    pub fn new(spec: WatchSpec, memory: Arc<dyn ProcessMemory>, decode_window: usize) -> Self {
        let is_64bit = memory.is_64bit();
        Self {
            spec,
            memory,
            decode_window: decode_window.max(1),
            is_64bit,
            table: Mutex::new(Table::default()),
            total_hits: AtomicU64::new(0),
            unique: AtomicUsize::new(0),
            discarded_hits: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &WatchSpec {
        &self.spec
    }

    /// トラップ1回分を記録する
    ///
    /// デコードはロックの外で行います。その間に `reset` された場合、
    /// このトラップはリセット前のものとして捨てます。
    pub fn on_trap(&self, instruction_address: u64, thread_id: ThreadId) -> TrapOutcome {
        let generation = {
            let mut table = self.table.lock();
            if let Some(record) = table.entries.get_mut(&instruction_address) {
                record.entry.count += 1;
                record.entry.last_thread_id = thread_id;
                self.record_hit();
                return TrapOutcome::Counted;
            }
            if table.discarded.contains(&instruction_address) {
                drop(table);
                self.discarded_hits.fetch_add(1, Ordering::Relaxed);
                trace!("Discarded repeated trap at 0x{:x}", instruction_address);
                return TrapOutcome::Discarded;
            }
            table.generation
        };

        let (disassembly, bytes, class) = match self.inspect(instruction_address) {
            Inspection::Outside => {
                let mut table = self.table.lock();
                if table.generation != generation {
                    return TrapOutcome::Superseded;
                }
                table.discarded.insert(instruction_address);
                drop(table);
                self.discarded_hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Discarded trap at 0x{:x}: operand outside {}",
                    instruction_address, self.spec
                );
                return TrapOutcome::Discarded;
            }
            Inspection::Relevant {
                disassembly,
                bytes,
                class,
            } => (disassembly, bytes, class),
        };

        let module = self
            .memory
            .owning_module(instruction_address)
            .map(|module| ModuleLocation {
                offset: instruction_address.wrapping_sub(module.base),
                name: module.name,
            });

        let mut table = self.table.lock();
        if table.generation != generation {
            debug!("Dropped trap at 0x{:x} that raced a reset", instruction_address);
            return TrapOutcome::Superseded;
        }
        let outcome = match table.entries.entry(instruction_address) {
            Entry::Occupied(mut occupied) => {
                let entry = &mut occupied.get_mut().entry;
                entry.count += 1;
                entry.last_thread_id = thread_id;
                TrapOutcome::Counted
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Record {
                    entry: AccessEntry {
                        instruction_address,
                        count: 1,
                        last_thread_id: thread_id,
                        disassembly,
                        module,
                        bytes,
                    },
                    class,
                });
                self.unique.fetch_add(1, Ordering::Relaxed);
                TrapOutcome::Inserted
            }
        };
        // カウンタはテーブルと同じロックの中で進める
        self.record_hit();
        outcome
    }

    fn inspect(&self, instruction_address: u64) -> Inspection {
        let bytes = match self.memory.read_bytes(instruction_address, self.decode_window) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                debug!("Empty read at 0x{:x}", instruction_address);
                return Inspection::Relevant {
                    disassembly: UNREADABLE_TEXT.to_string(),
                    bytes: Vec::new(),
                    class: None,
                };
            }
            Err(e) => {
                debug!("Failed to read instruction at 0x{:x}: {}", instruction_address, e);
                return Inspection::Relevant {
                    disassembly: UNREADABLE_TEXT.to_string(),
                    bytes: Vec::new(),
                    class: None,
                };
            }
        };

        match decode(&bytes, instruction_address, self.is_64bit) {
            Ok(instruction) => {
                if !overlaps_watched_range(&instruction, &self.spec) {
                    return Inspection::Outside;
                }
                let mut bytes = bytes;
                bytes.truncate(instruction.length);
                Inspection::Relevant {
                    disassembly: instruction.text(),
                    bytes,
                    class: Some(classify(&instruction)),
                }
            }
            Err(e) => {
                log_decode_failure(instruction_address, &e);
                Inspection::Relevant {
                    disassembly: INVALID_INSTRUCTION_TEXT.to_string(),
                    bytes,
                    class: None,
                }
            }
        }
    }

    fn record_hit(&self) {
        self.total_hits.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    /// 可視エントリのスナップショット
    ///
    /// ヒット数の降順、同数ならアドレスの昇順に並びます。
    /// 分類は作成時のものを使うため、メモリは読み直しません。
    pub fn snapshot(&self, policy: FilterPolicy) -> Vec<AccessEntry> {
        let write_only = self.spec.write_only();
        let mut visible: Vec<AccessEntry> = self
            .table
            .lock()
            .entries
            .values()
            .filter(|record| match &record.class {
                Some(class) => relevant_for(class, policy, write_only),
                // 読めない、またはデコードできない命令は常に可視
                None => true,
            })
            .map(|record| record.entry.clone())
            .collect();
        visible.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.instruction_address.cmp(&b.instruction_address))
        });
        visible
    }

    /// テーブルとカウンタを消去する
    pub fn reset(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.discarded.clear();
        table.generation += 1;
        self.total_hits.store(0, Ordering::Relaxed);
        self.unique.store(0, Ordering::Relaxed);
        self.discarded_hits.store(0, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    pub fn unique_count(&self) -> usize {
        self.unique.load(Ordering::Relaxed)
    }

    pub fn discarded_hits(&self) -> u64 {
        self.discarded_hits.load(Ordering::Relaxed)
    }

    /// 前回から記録があったかを返し、フラグを下ろす
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

enum Inspection {
    Outside,
    Relevant {
        disassembly: String,
        bytes: Vec<u8>,
        class: Option<Classification>,
    },
}

fn log_decode_failure(instruction_address: u64, error: &DecodeError) {
    debug!("Failed to decode instruction at 0x{:x}: {}", instruction_address, error);
}
