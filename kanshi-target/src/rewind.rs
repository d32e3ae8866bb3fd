//! トラップ後のRIPからアクセス命令の先頭を求める
//!
//! データウォッチポイントはアクセス命令の実行後に停止するため、
//! RIPは次の命令を指しています。RIPの直前最大15バイトを走査して、
//! ちょうどRIPで終わりメモリオペランドを持つ命令を候補として集めます。
//! 候補のオペランドをトラップ時のレジスタで評価し、発火した
//! ブレークポイントの範囲に触れるものを選びます。

use crate::breakpoint::HardwareBreakpoint;
use crate::memory::ProcessMemory;
use crate::Result;
use capstone::arch::x86::{X86OpMem, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::RegId;
use nix::libc::user_regs_struct;
use tracing::{debug, trace};

/// x86命令の最大長
pub const MAX_INSTRUCTION_LEN: usize = 15;

const PAGE_SIZE: u64 = 4096;

/// RIPで終わる命令の候補
struct Candidate {
    address: u64,
    /// (実効アドレス, サイズ)。アドレスを計算できなければ `None`
    operands: Vec<(Option<u64>, u64)>,
}

impl Candidate {
    fn touches(&self, triggered: &[HardwareBreakpoint]) -> bool {
        self.operands.iter().any(|&(address, size)| {
            address.is_some_and(|address| triggered.iter().any(|bp| bp.overlaps(address, size)))
        })
    }
}

fn build_capstone(is_64bit: bool) -> Result<Capstone> {
    let mode = if is_64bit {
        arch::x86::ArchMode::Mode64
    } else {
        arch::x86::ArchMode::Mode32
    };
    Capstone::new()
        .x86()
        .mode(mode)
        .syntax(arch::x86::ArchSyntax::Intel)
        .detail(true)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// レジスタ名から値を取得する（32bitレジスタは下位32bit）
fn register_value(regs: &user_regs_struct, name: &str) -> Option<u64> {
    let (wide, mask) = match name {
        "eax" | "ebx" | "ecx" | "edx" | "esi" | "edi" | "ebp" | "esp" => {
            (format!("r{}", &name[1..]), 0xffff_ffff)
        }
        // r8d〜r15d
        _ => match name.strip_suffix('d') {
            Some(wide) if wide.starts_with('r') && wide.len() > 1 => {
                (wide.to_string(), 0xffff_ffff)
            }
            _ => (name.to_string(), u64::MAX),
        },
    };

    let value = match wide.as_str() {
        "rax" => regs.rax,
        "rbx" => regs.rbx,
        "rcx" => regs.rcx,
        "rdx" => regs.rdx,
        "rsi" => regs.rsi,
        "rdi" => regs.rdi,
        "rbp" => regs.rbp,
        "rsp" => regs.rsp,
        "r8" => regs.r8,
        "r9" => regs.r9,
        "r10" => regs.r10,
        "r11" => regs.r11,
        "r12" => regs.r12,
        "r13" => regs.r13,
        "r14" => regs.r14,
        "r15" => regs.r15,
        _ => return None,
    };
    Some(value & mask)
}

/// メモリオペランドの実効アドレスを計算する
fn effective_address(
    cs: &Capstone,
    mem: &X86OpMem,
    regs: &user_regs_struct,
    next_address: u64,
    is_64bit: bool,
) -> Option<u64> {
    let register = |id: RegId| -> Option<u64> {
        if id.0 == 0 {
            return Some(0);
        }
        let name = cs.reg_name(id)?;
        match name.as_str() {
            "rip" | "eip" => Some(next_address),
            _ => register_value(regs, &name),
        }
    };

    let base = register(mem.base())?;
    let index = register(mem.index())?;
    let segment = match cs.reg_name(mem.segment()).as_deref() {
        Some("fs") => regs.fs_base,
        Some("gs") => regs.gs_base,
        _ => 0,
    };

    let address = segment
        .wrapping_add(base)
        .wrapping_add(index.wrapping_mul(mem.scale() as u64))
        .wrapping_add(mem.disp() as u64);
    Some(if is_64bit { address } else { address & 0xffff_ffff })
}

/// ちょうどRIPで終わりメモリオペランドを持つ命令を、RIPに近い順に集める
fn candidates(
    cs: &Capstone,
    window: &[u8],
    rip: u64,
    regs: &user_regs_struct,
    is_64bit: bool,
) -> Vec<Candidate> {
    let window_start = rip - window.len() as u64;
    let mut found = Vec::new();

    for offset in (0..window.len()).rev() {
        let start = window_start + offset as u64;
        let Ok(insns) = cs.disasm_count(&window[offset..], start, 1) else {
            continue;
        };
        let Some(insn) = insns.as_ref().first() else {
            continue;
        };
        if start + insn.len() as u64 != rip {
            continue;
        }
        let Ok(detail) = cs.insn_detail(insn) else {
            continue;
        };

        let operands: Vec<(Option<u64>, u64)> = detail
            .arch_detail()
            .operands()
            .into_iter()
            .filter_map(|operand| match operand {
                ArchOperand::X86Operand(operand) => match operand.op_type {
                    X86OperandType::Mem(mem) => Some((
                        effective_address(cs, &mem, regs, rip, is_64bit),
                        operand.size.max(1) as u64,
                    )),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        if !operands.is_empty() {
            found.push(Candidate {
                address: start,
                operands,
            });
        }
    }

    found
}

/// RIP直前のバイト列からアクセス命令のアドレスを推定する
///
/// # Arguments
/// * `window` - `rip - window.len()` から `rip` までのバイト列
/// * `regs` - トラップ時のレジスタ（`rip` を含む）
/// * `triggered` - 発火したブレークポイント
///
/// # Returns
/// 発火範囲に触れる候補のうちRIPに最も近いもの。触れる候補がなければ
/// RIPに最も近い候補。候補がなければ `None`
pub fn previous_instruction(
    window: &[u8],
    regs: &user_regs_struct,
    is_64bit: bool,
    triggered: &[HardwareBreakpoint],
) -> Result<Option<u64>> {
    let cs = build_capstone(is_64bit)?;
    let found = candidates(&cs, window, regs.rip, regs, is_64bit);

    let chosen = found
        .iter()
        .find(|candidate| candidate.touches(triggered))
        .or(found.first());
    Ok(chosen.map(|candidate| candidate.address))
}

/// RIPで終わるバイト列を読む
///
/// 直前のページが読めない場合は、RIPのページ先頭から読み直します。
fn read_window(memory: &dyn ProcessMemory, rip: u64) -> Option<Vec<u8>> {
    let full = rip.min(MAX_INSTRUCTION_LEN as u64);
    let clipped = rip - (rip & !(PAGE_SIZE - 1));

    let mut lengths = vec![full];
    if clipped > 0 && clipped < full {
        lengths.push(clipped);
    }

    for len in lengths {
        match memory.read_bytes(rip - len, len as usize) {
            Ok(bytes) if bytes.len() as u64 == len => return Some(bytes),
            Ok(bytes) => trace!(
                rip = format_args!("0x{:x}", rip),
                len,
                read = bytes.len(),
                "Short rewind window"
            ),
            Err(e) => trace!(
                rip = format_args!("0x{:x}", rip),
                len,
                error = %e,
                "Rewind window unreadable"
            ),
        }
    }
    None
}

/// ターゲットのメモリを読んでアクセス命令のアドレスを求める
///
/// 読み取りや推定に失敗した場合はRIPをそのまま返します。
pub fn faulting_instruction(
    memory: &dyn ProcessMemory,
    regs: &user_regs_struct,
    triggered: &[HardwareBreakpoint],
) -> u64 {
    let rip = regs.rip;
    let Some(window) = read_window(memory, rip) else {
        return rip;
    };

    match previous_instruction(&window, regs, memory.is_64bit(), triggered) {
        Ok(Some(addr)) => addr,
        Ok(None) => rip,
        Err(e) => {
            debug!(error = %e, "Rewind failed");
            rip
        }
    }
}
