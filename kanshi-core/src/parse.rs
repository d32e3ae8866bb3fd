//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use kanshi_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// バイト数をパース（10進数または0x付き16進数）
pub fn parse_size(s: &str) -> Result<usize> {
    let value = parse_address(s).map_err(|_| anyhow::anyhow!("Invalid size '{}'", s.trim()))?;
    usize::try_from(value).map_err(|_| anyhow::anyhow!("Size '{}' is too large", s.trim()))
}
