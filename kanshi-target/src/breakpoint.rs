//! ハードウェアブレークポイント（データウォッチポイント）機能
//!
//! 監視範囲を自然境界に揃った1/2/4/8バイトの塊に分割し、
//! 塊ごとにデバッグレジスタを1つ割り当てます。

use crate::registers::Registers;
use crate::watch::WatchSpec;
use crate::Result;

/// DR7のRWフィールド: 書き込みのみ
const RW_WRITE: u64 = 0b01;
/// DR7のRWフィールド: 読み書き
const RW_READ_WRITE: u64 = 0b11;

/// DR6のトリガ状態ビット（B0〜B3）
const DR6_TRIGGER_MASK: u64 = 0b1111;

/// ハードウェアブレークポイント（デバッグレジスタ1本分）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareBreakpoint {
    address: u64,
    len: u8,
    index: usize,
}

impl HardwareBreakpoint {
    /// ハードウェアブレークポイントを作成する
    pub fn new(address: u64, len: u8, index: usize) -> Self {
        Self { address, len, index }
    }

    /// [start, start+len) がこのブレークポイントの監視範囲と重なるか
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len.max(1));
        start < self.address + self.len as u64 && self.address < end
    }

    /// DR7のLENフィールドのエンコード
    fn len_bits(&self) -> u64 {
        match self.len {
            1 => 0b00,
            2 => 0b01,
            8 => 0b10,
            _ => 0b11,
        }
    }

    /// このブレークポイントを有効化するDR7ビット
    fn dr7_bits(&self, write_only: bool) -> u64 {
        let rw = if write_only { RW_WRITE } else { RW_READ_WRITE };
        let shift = 16 + 4 * self.index as u64;
        (1 << (2 * self.index)) | (rw << shift) | (self.len_bits() << (shift + 2))
    }

    /// このスロットに関係するDR7ビット全体（解除用マスク）
    fn dr7_mask(&self) -> u64 {
        let shift = 16 + 4 * self.index as u64;
        (0b11 << (2 * self.index)) | (0b1111 << shift)
    }
}

/// 監視範囲を自然境界の塊に分割する
///
/// 戻り値は (アドレス, 長さ) のリスト。
pub fn split_aligned(base: u64, size: usize) -> Vec<(u64, u8)> {
    let end = base + size as u64;
    let mut chunks = Vec::new();
    let mut addr = base;

    while addr < end {
        let remaining = end - addr;
        let mut len: u64 = 8;
        while len > 1 && (addr % len != 0 || len > remaining) {
            len /= 2;
        }
        chunks.push((addr, len as u8));
        addr += len;
    }

    chunks
}

/// 1つの監視に必要なハードウェアブレークポイントの集合
#[derive(Debug, Clone)]
pub struct HardwareWatch {
    breakpoints: Vec<HardwareBreakpoint>,
    write_only: bool,
}

impl HardwareWatch {
    /// 監視に必要なデバッグレジスタ数
    pub fn slots_needed(spec: &WatchSpec) -> usize {
        split_aligned(spec.base_address(), spec.size()).len()
    }

    /// 予約済みスロットを使って監視を構成する
    ///
    /// `indices` の数は [`HardwareWatch::slots_needed`] 以上である必要があります。
    pub fn new(spec: &WatchSpec, indices: &[usize]) -> Result<Self> {
        let chunks = split_aligned(spec.base_address(), spec.size());
        if indices.len() < chunks.len() {
            return Err(anyhow::anyhow!(
                "Watch needs {} debug registers but only {} reserved",
                chunks.len(),
                indices.len()
            ));
        }

        let breakpoints = chunks
            .into_iter()
            .zip(indices)
            .map(|((address, len), &index)| HardwareBreakpoint::new(address, len, index))
            .collect();

        Ok(Self {
            breakpoints,
            write_only: spec.write_only(),
        })
    }

    /// 有効化に必要なDR7ビット
    pub fn dr7_bits(&self) -> u64 {
        self.breakpoints
            .iter()
            .fold(0, |bits, bp| bits | bp.dr7_bits(self.write_only))
    }

    /// このウォッチが使うDR7ビット全体
    pub fn dr7_mask(&self) -> u64 {
        self.breakpoints.iter().fold(0, |mask, bp| mask | bp.dr7_mask())
    }

    /// DR6の値から、このウォッチで発火したブレークポイントを求める
    ///
    /// 空なら他の要因（シングルステップや別のデバッガ）によるトラップです。
    pub fn triggered(&self, dr6: u64) -> Vec<HardwareBreakpoint> {
        self.breakpoints
            .iter()
            .filter(|bp| dr6 & DR6_TRIGGER_MASK & (1 << bp.index) != 0)
            .copied()
            .collect()
    }

    /// スレッドのデバッグレジスタに書き込む
    ///
    /// 既存のDR7ビットは保持したまま、自分のスロットだけを有効化します。
    pub fn install(&self, registers: &Registers) -> Result<()> {
        for bp in &self.breakpoints {
            registers.write_debug_register(bp.index, bp.address)?;
        }
        let dr7 = registers.read_debug_register(7)?;
        registers.write_debug_register(7, (dr7 & !self.dr7_mask()) | self.dr7_bits())
    }

    /// スレッドのデバッグレジスタから取り除く
    pub fn remove(&self, registers: &Registers) -> Result<()> {
        let dr7 = registers.read_debug_register(7)?;
        registers.write_debug_register(7, dr7 & !self.dr7_mask())?;
        for bp in &self.breakpoints {
            registers.write_debug_register(bp.index, 0)?;
        }
        Ok(())
    }
}
