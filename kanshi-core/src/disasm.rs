//! 逆アセンブル機能
//!
//! トラップした命令のバイト列をデコードし、ニーモニックの分類と
//! メモリオペランドのアドレス形式を1回で求めます。

use capstone::arch::x86::X86OperandType;
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use thiserror::Error;

/// x86命令の最大長
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// デコード失敗
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("No instruction bytes")]
    Empty,

    #[error("Invalid instruction at 0x{0:x}")]
    Invalid(u64),

    #[error("Disassembler error: {0}")]
    Backend(String),
}

/// ニーモニックの分類（デコード時に1回だけ決定する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeClass {
    /// cmp, test, 文字列比較
    IntegerCompare,
    /// fcom, fucomi, comiss など
    FloatCompare,
    /// bt
    BitTest,
    /// pcmpeqd, cmpps, ptest など
    PackedCompare,
    /// add, sub, inc, and, shl, rol, bts など
    IntegerArithmetic,
    /// fadd, addss, mulsd など
    FloatArithmetic,
    /// paddd, pxor, psllq など
    PackedArithmetic,
    /// push
    Push,
    /// fst, fstp, fistp など
    FloatStore,
    /// stos, movs
    StringStore,
    /// 上記以外（mov など）
    Other,
}

/// 命令プレフィックス（capstoneはニーモニックに含めて出力する）
const PREFIXES: &[&str] = &[
    "lock", "rep", "repe", "repz", "repne", "repnz", "bnd", "notrack", "xacquire", "xrelease",
];

impl OpcodeClass {
    /// プレフィックスを除いたニーモニックから分類する
    pub fn from_mnemonic(mnemonic: &str) -> Self {
        let m = mnemonic;

        if matches!(
            m,
            "cmp" | "test" | "cmpsb" | "cmpsw" | "cmpsd" | "cmpsq" | "scasb" | "scasw" | "scasd"
                | "scasq"
        ) {
            return OpcodeClass::IntegerCompare;
        }
        if matches!(
            m,
            "fcom" | "fcomp" | "fcompp" | "fucom" | "fucomp" | "fucompp" | "fcomi" | "fcomip"
                | "fucomi" | "fucomip" | "ficom" | "ficomp" | "ftst"
                | "comiss" | "comisd" | "ucomiss" | "ucomisd"
                | "vcomiss" | "vcomisd" | "vucomiss" | "vucomisd"
        ) {
            return OpcodeClass::FloatCompare;
        }
        if m == "bt" {
            return OpcodeClass::BitTest;
        }
        if is_packed_compare(m) {
            return OpcodeClass::PackedCompare;
        }
        if matches!(
            m,
            "add" | "adc" | "sub" | "sbb" | "mul" | "imul" | "div" | "idiv" | "inc" | "dec"
                | "neg" | "not" | "and" | "or" | "xor" | "shl" | "sal" | "shr" | "sar" | "rol"
                | "ror" | "rcl" | "rcr" | "shld" | "shrd" | "xadd" | "bts" | "btr" | "btc"
                | "andn"
        ) {
            return OpcodeClass::IntegerArithmetic;
        }
        if is_float_arithmetic(m) {
            return OpcodeClass::FloatArithmetic;
        }
        if is_packed_arithmetic(m) {
            return OpcodeClass::PackedArithmetic;
        }
        if m == "push" {
            return OpcodeClass::Push;
        }
        if matches!(
            m,
            "fst" | "fstp" | "fist" | "fistp" | "fisttp" | "fbstp" | "fnstcw" | "fstcw" | "fnstsw"
                | "fstsw" | "fnstenv" | "fstenv" | "fnsave" | "fsave"
        ) {
            return OpcodeClass::FloatStore;
        }
        if matches!(
            m,
            "stosb" | "stosw" | "stosd" | "stosq" | "movsb" | "movsw" | "movsq"
        ) {
            return OpcodeClass::StringStore;
        }
        // movsd は文字列命令とSSE命令の両方に使われる
        if m == "movsd" {
            return OpcodeClass::StringStore;
        }

        OpcodeClass::Other
    }
}

fn is_packed_compare(m: &str) -> bool {
    let m = m.strip_prefix('v').unwrap_or(m);
    if m.starts_with("pcmp") || m == "ptest" || m.starts_with("cmpps") || m.starts_with("cmppd") {
        return true;
    }
    // cmpeqps, cmpltss, cmpneqsd などの擬似ニーモニック
    m.starts_with("cmp")
        && ["ps", "pd", "ss", "sd"].iter().any(|suffix| m.ends_with(suffix))
}

fn is_float_arithmetic(m: &str) -> bool {
    if matches!(
        m,
        "fadd" | "faddp" | "fiadd" | "fsub" | "fsubp" | "fsubr" | "fsubrp" | "fisub" | "fisubr"
            | "fmul" | "fmulp" | "fimul" | "fdiv" | "fdivp" | "fdivr" | "fdivrp" | "fidiv"
            | "fidivr"
    ) {
        return true;
    }
    let m = m.strip_prefix('v').unwrap_or(m);
    let Some(suffix_at) = m.len().checked_sub(2) else {
        return false;
    };
    let (op, suffix) = m.split_at(suffix_at);
    matches!(suffix, "ss" | "sd" | "ps" | "pd")
        && matches!(op, "add" | "sub" | "mul" | "div" | "and" | "andn" | "or" | "xor")
}

fn is_packed_arithmetic(m: &str) -> bool {
    let m = m.strip_prefix('v').unwrap_or(m);
    ["padd", "psub", "pmul", "psll", "psrl", "psra"]
        .iter()
        .any(|prefix| m.starts_with(prefix))
        || matches!(m, "pand" | "pandn" | "por" | "pxor")
}

/// メモリオペランドのアドレス形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandAddress {
    /// 静的に決まる絶対アドレス（RIP相対を含む）
    Absolute(u64),
    /// 実行時のレジスタ値に依存する
    Dynamic,
}

/// メモリオペランド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub address: OperandAddress,
    /// アクセスサイズ（バイト）
    pub size: u8,
    /// オペランドの位置（0が第1オペランド）
    pub position: usize,
}

/// デコード済み命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub length: usize,
    /// プレフィックスを含むニーモニック（表示用）
    pub mnemonic: String,
    pub operands: String,
    pub class: OpcodeClass,
    pub has_rep_prefix: bool,
    pub memory_operands: Vec<MemoryOperand>,
}

impl Instruction {
    /// Intel構文の命令文字列
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }

    /// 第1オペランドがメモリか
    pub fn destination_is_memory(&self) -> bool {
        self.memory_operands.iter().any(|op| op.position == 0)
    }

    /// メモリオペランドを持つか
    pub fn has_memory_operand(&self) -> bool {
        !self.memory_operands.is_empty()
    }
}

/// ニーモニックからプレフィックスを取り除く
///
/// 戻り値は (本体, repプレフィックスの有無)。
fn split_prefixes(mnemonic: &str) -> (&str, bool) {
    let mut has_rep = false;
    let mut rest = mnemonic;
    loop {
        let Some((head, tail)) = rest.split_once(' ') else {
            break;
        };
        if !PREFIXES.contains(&head) {
            break;
        }
        has_rep |= head.starts_with("rep");
        rest = tail.trim_start();
    }
    (rest, has_rep)
}

fn build_capstone(is_64bit: bool) -> Result<Capstone, DecodeError> {
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
        .map_err(|e| DecodeError::Backend(e.to_string()))
}

/// 1命令をデコードする
///
/// # Arguments
/// * `bytes` - 命令の先頭からのバイト列（最大15バイトを使用）
/// * `address` - 命令のアドレス
/// * `is_64bit` - 対象が64bitモードか
pub fn decode(bytes: &[u8], address: u64, is_64bit: bool) -> Result<Instruction, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];

    let cs = build_capstone(is_64bit)?;
    let insns = cs
        .disasm_count(window, address, 1)
        .map_err(|_| DecodeError::Invalid(address))?;
    let insn = insns
        .as_ref()
        .first()
        .ok_or(DecodeError::Invalid(address))?;

    let full_mnemonic = insn.mnemonic().unwrap_or("").to_string();
    let (mnemonic, has_rep_prefix) = split_prefixes(&full_mnemonic);
    let class = OpcodeClass::from_mnemonic(mnemonic);
    let length = insn.len();
    let next_address = address.wrapping_add(length as u64);

    let detail = cs
        .insn_detail(insn)
        .map_err(|e| DecodeError::Backend(e.to_string()))?;

    let mut memory_operands = Vec::new();
    for (position, operand) in detail.arch_detail().operands().into_iter().enumerate() {
        let ArchOperand::X86Operand(operand) = operand else {
            continue;
        };
        let X86OperandType::Mem(mem) = operand.op_type else {
            continue;
        };

        let base = mem.base();
        let index = mem.index();
        let segment = cs.reg_name(mem.segment());
        // fs:/gs: はスレッドごとのベースに依存する
        let segmented = matches!(segment.as_deref(), Some("fs") | Some("gs"));

        let address = if segmented || index.0 != 0 {
            OperandAddress::Dynamic
        } else if base.0 == 0 {
            let absolute = mem.disp() as u64;
            if is_64bit {
                OperandAddress::Absolute(absolute)
            } else {
                OperandAddress::Absolute(absolute & 0xffff_ffff)
            }
        } else if matches!(cs.reg_name(base).as_deref(), Some("rip")) {
            OperandAddress::Absolute(next_address.wrapping_add(mem.disp() as u64))
        } else {
            OperandAddress::Dynamic
        };

        memory_operands.push(MemoryOperand {
            address,
            size: operand.size.max(1),
            position,
        });
    }

    Ok(Instruction {
        address,
        length,
        mnemonic: full_mnemonic,
        operands: insn.op_str().unwrap_or("").to_string(),
        class,
        has_rep_prefix,
        memory_operands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rip_relative_store() {
        // mov dword ptr [rip + 0x300a], eax
        let insn = decode(&[0x89, 0x05, 0x0a, 0x30, 0x00, 0x00], 0x401000, true).unwrap();
        assert_eq!(insn.length, 6);
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.class, OpcodeClass::Other);
        assert!(insn.destination_is_memory());
        assert_eq!(
            insn.memory_operands,
            vec![MemoryOperand {
                address: OperandAddress::Absolute(0x404010),
                size: 4,
                position: 0,
            }]
        );
    }

    #[test]
    fn test_decode_register_relative_load() {
        // mov eax, dword ptr [rax + 8]
        let insn = decode(&[0x8b, 0x40, 0x08], 0x1000, true).unwrap();
        assert_eq!(insn.text(), "mov eax, dword ptr [rax + 8]");
        assert!(!insn.destination_is_memory());
        assert_eq!(insn.memory_operands[0].address, OperandAddress::Dynamic);
        assert_eq!(insn.memory_operands[0].position, 1);
    }

    #[test]
    fn test_decode_absolute_32bit() {
        // mov dword ptr [0x404010], eax（32bitモード）
        let insn = decode(&[0x89, 0x05, 0x10, 0x40, 0x40, 0x00], 0x401000, false).unwrap();
        assert_eq!(
            insn.memory_operands[0].address,
            OperandAddress::Absolute(0x404010)
        );
    }

    #[test]
    fn test_decode_rep_stos() {
        // rep stosd dword ptr es:[rdi], eax
        let insn = decode(&[0xf3, 0xab], 0x1000, true).unwrap();
        assert_eq!(insn.class, OpcodeClass::StringStore);
        assert!(insn.has_rep_prefix);
    }

    #[test]
    fn test_decode_fs_segment_is_dynamic() {
        // mov rax, qword ptr fs:[0x28]
        let insn = decode(
            &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00],
            0x1000,
            true,
        )
        .unwrap();
        assert_eq!(insn.memory_operands[0].address, OperandAddress::Dynamic);
    }

    #[test]
    fn test_decode_uses_only_first_instruction() {
        // nop; nop
        let insn = decode(&[0x90, 0x90], 0x1000, true).unwrap();
        assert_eq!(insn.length, 1);
        assert!(!insn.has_memory_operand());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[], 0x1000, true), Err(DecodeError::Empty));
        // 64bitモードでは push es (0x06) は無効
        assert_eq!(decode(&[0x06], 0x1000, true), Err(DecodeError::Invalid(0x1000)));
        // 途中で切れた命令
        assert!(decode(&[0x89, 0x05, 0x0a], 0x1000, true).is_err());
    }

    #[test]
    fn test_split_prefixes() {
        assert_eq!(split_prefixes("rep stosd"), ("stosd", true));
        assert_eq!(split_prefixes("lock add"), ("add", false));
        assert_eq!(split_prefixes("mov"), ("mov", false));
    }

    #[test]
    fn test_opcode_class_from_mnemonic() {
        assert_eq!(OpcodeClass::from_mnemonic("cmp"), OpcodeClass::IntegerCompare);
        assert_eq!(OpcodeClass::from_mnemonic("ucomisd"), OpcodeClass::FloatCompare);
        assert_eq!(OpcodeClass::from_mnemonic("bt"), OpcodeClass::BitTest);
        assert_eq!(OpcodeClass::from_mnemonic("pcmpeqd"), OpcodeClass::PackedCompare);
        assert_eq!(OpcodeClass::from_mnemonic("cmpltps"), OpcodeClass::PackedCompare);
        assert_eq!(OpcodeClass::from_mnemonic("vptest"), OpcodeClass::PackedCompare);
        assert_eq!(OpcodeClass::from_mnemonic("xadd"), OpcodeClass::IntegerArithmetic);
        assert_eq!(OpcodeClass::from_mnemonic("mulsd"), OpcodeClass::FloatArithmetic);
        assert_eq!(OpcodeClass::from_mnemonic("vaddps"), OpcodeClass::FloatArithmetic);
        assert_eq!(OpcodeClass::from_mnemonic("fidivr"), OpcodeClass::FloatArithmetic);
        assert_eq!(OpcodeClass::from_mnemonic("pxor"), OpcodeClass::PackedArithmetic);
        assert_eq!(OpcodeClass::from_mnemonic("push"), OpcodeClass::Push);
        assert_eq!(OpcodeClass::from_mnemonic("fistp"), OpcodeClass::FloatStore);
        assert_eq!(OpcodeClass::from_mnemonic("stosq"), OpcodeClass::StringStore);
        assert_eq!(OpcodeClass::from_mnemonic("mov"), OpcodeClass::Other);
        assert_eq!(OpcodeClass::from_mnemonic("movss"), OpcodeClass::Other);
        assert_eq!(OpcodeClass::from_mnemonic("lea"), OpcodeClass::Other);
    }
}
