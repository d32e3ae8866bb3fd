//! 命令の意味的な分類と可視性の判定
//!
//! すべて純粋関数です。判定できない場合は「関係あり」として扱い、
//! 本当のアクセス元を隠さないようにします。

use crate::disasm::{Instruction, OpcodeClass, OperandAddress};
use kanshi_target::WatchSpec;
use std::fmt;
use std::str::FromStr;

/// 表示フィルタ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterPolicy {
    /// すべて表示
    #[default]
    All,
    /// 比較命令を除外
    ExcludeComparisons,
    /// 算術・ビット演算命令のみ
    ArithmeticOnly,
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPolicy::All => write!(f, "all"),
            FilterPolicy::ExcludeComparisons => write!(f, "exclude comparisons"),
            FilterPolicy::ArithmeticOnly => write!(f, "arithmetic only"),
        }
    }
}

impl FromStr for FilterPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" | "a" => Ok(FilterPolicy::All),
            "nocmp" | "exclude-comparisons" | "no-compare" => Ok(FilterPolicy::ExcludeComparisons),
            "arith" | "arithmetic" => Ok(FilterPolicy::ArithmeticOnly),
            other => Err(anyhow::anyhow!(
                "Unknown filter '{}' (expected all, nocmp or arith)",
                other
            )),
        }
    }
}

/// 命令の分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub is_comparison: bool,
    pub is_arithmetic: bool,
    pub writes_memory: bool,
}

/// 命令を分類する
pub fn classify(instruction: &Instruction) -> Classification {
    let is_comparison = match instruction.class {
        OpcodeClass::IntegerCompare
        | OpcodeClass::FloatCompare
        | OpcodeClass::BitTest
        | OpcodeClass::PackedCompare => true,
        OpcodeClass::IntegerArithmetic
        | OpcodeClass::FloatArithmetic
        | OpcodeClass::PackedArithmetic
        | OpcodeClass::Push
        | OpcodeClass::FloatStore
        | OpcodeClass::StringStore
        | OpcodeClass::Other => false,
    };

    let is_arithmetic = match instruction.class {
        OpcodeClass::IntegerArithmetic
        | OpcodeClass::FloatArithmetic
        | OpcodeClass::PackedArithmetic => instruction.has_memory_operand(),
        OpcodeClass::IntegerCompare
        | OpcodeClass::FloatCompare
        | OpcodeClass::BitTest
        | OpcodeClass::PackedCompare
        | OpcodeClass::Push
        | OpcodeClass::FloatStore
        | OpcodeClass::StringStore
        | OpcodeClass::Other => false,
    };

    let writes_memory = match instruction.class {
        // 比較は読み取りのみ
        OpcodeClass::IntegerCompare
        | OpcodeClass::FloatCompare
        | OpcodeClass::BitTest
        | OpcodeClass::PackedCompare => false,
        OpcodeClass::Push | OpcodeClass::FloatStore => true,
        OpcodeClass::StringStore => {
            instruction.has_rep_prefix || instruction.destination_is_memory()
        }
        OpcodeClass::IntegerArithmetic
        | OpcodeClass::FloatArithmetic
        | OpcodeClass::PackedArithmetic
        | OpcodeClass::Other => instruction.destination_is_memory(),
    };

    Classification {
        is_comparison,
        is_arithmetic,
        writes_memory,
    }
}

/// 命令のメモリオペランドが監視範囲と重なりうるか
///
/// レジスタ依存のオペランドや、メモリオペランドを持たない命令は
/// 静的に除外できないため重なるものとして扱います。
pub fn overlaps_watched_range(instruction: &Instruction, spec: &WatchSpec) -> bool {
    if !instruction.has_memory_operand() {
        return true;
    }

    instruction.memory_operands.iter().any(|operand| match operand.address {
        OperandAddress::Dynamic => true,
        OperandAddress::Absolute(start) => spec.overlaps(start, operand.size as u64),
    })
}

/// 分類結果がフィルタに対して可視か
pub fn relevant_for(classification: &Classification, policy: FilterPolicy, write_only: bool) -> bool {
    if write_only {
        return classification.writes_memory;
    }
    match policy {
        FilterPolicy::All => true,
        FilterPolicy::ExcludeComparisons => !classification.is_comparison,
        FilterPolicy::ArithmeticOnly => classification.is_arithmetic,
    }
}
