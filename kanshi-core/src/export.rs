//! 集計結果のテキスト出力
//!
//! 形式は列位置で読み戻せる固定幅の表です。
//!
//! ```text
//! Count     Address             Disassembly                        Module
//! ----------------------------------------------------------------------------
//! 3         0x0000000000401000  mov dword ptr [rip + 0x300a], eax  target+0x1000
//! Total: 1 unique instruction(s), 3 total hit(s)
//! ```

use crate::aggregator::AccessEntry;
use crate::errors::ExportError;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const COUNT_WIDTH: usize = 10;
const ADDRESS_WIDTH: usize = 20;
const COLUMN_GAP: usize = 2;
const DISASSEMBLY_HEADER: &str = "Disassembly";
const MODULE_HEADER: &str = "Module";

/// 読み戻した1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub count: u64,
    pub address: u64,
    pub disassembly: String,
    pub module: String,
}

/// 表を書き出す
pub fn write_report<W: Write>(writer: &mut W, entries: &[AccessEntry]) -> io::Result<()> {
    let disassembly_width = entries
        .iter()
        .map(|e| e.disassembly.len())
        .chain(std::iter::once(DISASSEMBLY_HEADER.len()))
        .max()
        .unwrap_or(DISASSEMBLY_HEADER.len());
    let modules: Vec<String> = entries.iter().map(AccessEntry::module_text).collect();
    let module_width = modules
        .iter()
        .map(String::len)
        .chain(std::iter::once(MODULE_HEADER.len()))
        .max()
        .unwrap_or(MODULE_HEADER.len());

    writeln!(
        writer,
        "{:<cw$}{:<aw$}{:<dw$}{:gap$}{}",
        "Count",
        "Address",
        DISASSEMBLY_HEADER,
        "",
        MODULE_HEADER,
        cw = COUNT_WIDTH,
        aw = ADDRESS_WIDTH,
        dw = disassembly_width,
        gap = COLUMN_GAP,
    )?;
    let rule_len = COUNT_WIDTH + ADDRESS_WIDTH + disassembly_width + COLUMN_GAP + module_width;
    writeln!(writer, "{}", "-".repeat(rule_len))?;

    let mut total: u64 = 0;
    for (entry, module) in entries.iter().zip(&modules) {
        total += entry.count;
        writeln!(
            writer,
            "{:<cw$}{:<aw$}{:<dw$}{:gap$}{}",
            entry.count,
            format!("0x{:016x}", entry.instruction_address),
            entry.disassembly,
            "",
            module,
            cw = COUNT_WIDTH,
            aw = ADDRESS_WIDTH,
            dw = disassembly_width,
            gap = COLUMN_GAP,
        )?;
    }

    writeln!(
        writer,
        "Total: {} unique instruction(s), {} total hit(s)",
        entries.len(),
        total
    )
}

/// 表を文字列にする
pub fn format_report(entries: &[AccessEntry]) -> String {
    let mut buffer = Vec::new();
    // Vec への書き込みは失敗しない
    let _ = write_report(&mut buffer, entries);
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 表をファイルに書き出す
pub fn export_to_text(path: &Path, entries: &[AccessEntry]) -> Result<(), ExportError> {
    let io_error = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    write_report(&mut writer, entries).map_err(io_error)?;
    writer.flush().map_err(io_error)
}

/// 出力した表を列位置で読み戻す
pub fn parse_report(text: &str) -> Result<Vec<ReportRow>, ExportError> {
    let mut lines = text.lines().enumerate();

    let (_, header) = lines.next().ok_or_else(|| malformed(1, "missing header"))?;
    if !header.starts_with("Count") {
        return Err(malformed(1, "missing header"));
    }
    let module_column = header
        .rfind(MODULE_HEADER)
        .ok_or_else(|| malformed(1, "missing Module column"))?;
    let disassembly_column = COUNT_WIDTH + ADDRESS_WIDTH;

    match lines.next() {
        Some((_, rule)) if rule.starts_with('-') => {}
        _ => return Err(malformed(2, "missing rule")),
    }

    let mut rows = Vec::new();
    for (index, line) in lines {
        let line_no = index + 1;
        if line.starts_with("Total:") {
            return Ok(rows);
        }
        if line.trim().is_empty() {
            continue;
        }

        let count_text = line
            .get(..COUNT_WIDTH)
            .ok_or_else(|| malformed(line_no, "short row"))?;
        let count = count_text
            .trim()
            .parse::<u64>()
            .map_err(|e| malformed(line_no, &format!("bad count: {}", e)))?;

        let address_text = line
            .get(COUNT_WIDTH..disassembly_column)
            .ok_or_else(|| malformed(line_no, "short row"))?;
        let address_text = address_text.trim();
        let address = address_text
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(|| malformed(line_no, &format!("bad address '{}'", address_text)))?;

        let disassembly = line
            .get(disassembly_column..module_column)
            .ok_or_else(|| malformed(line_no, "short row"))?
            .trim()
            .to_string();
        let module = line.get(module_column..).unwrap_or("").trim().to_string();

        rows.push(ReportRow {
            count,
            address,
            disassembly,
            module,
        });
    }

    Err(malformed(text.lines().count(), "missing Total line"))
}

fn malformed(line: usize, reason: &str) -> ExportError {
    ExportError::Malformed {
        line,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ModuleLocation;

    fn entry(address: u64, count: u64, disassembly: &str, module: Option<(&str, u64)>) -> AccessEntry {
        AccessEntry {
            instruction_address: address,
            count,
            last_thread_id: 1,
            disassembly: disassembly.to_string(),
            module: module.map(|(name, offset)| ModuleLocation {
                name: name.to_string(),
                offset,
            }),
            bytes: Vec::new(),
        }
    }

    #[test]
    fn test_format_report_layout() {
        let entries = vec![
            entry(0x401000, 3, "mov dword ptr [rip + 0x300a], eax", Some(("target", 0x1000))),
            entry(0x401020, 2, "cmp dword ptr [rip + 0x2fe9], 0", None),
        ];
        let text = format_report(&entries);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("Count     Address             Disassembly"));
        assert!(lines[0].ends_with("Module"));
        assert!(lines[1].chars().all(|c| c == '-'));
        assert_eq!(
            lines[2],
            "3         0x0000000000401000  mov dword ptr [rip + 0x300a], eax  target+0x1000"
        );
        assert_eq!(
            lines[3],
            "2         0x0000000000401020  cmp dword ptr [rip + 0x2fe9], 0    -"
        );
        assert_eq!(lines[4], "Total: 2 unique instruction(s), 5 total hit(s)");
    }

    #[test]
    fn test_empty_report() {
        let text = format_report(&[]);
        assert!(text.ends_with("Total: 0 unique instruction(s), 0 total hit(s)\n"));
        assert!(parse_report(&text).unwrap().is_empty());
    }

    #[test]
    fn test_parse_report_reads_columns() {
        let entries = vec![
            entry(0x7f00_0000_1234, 1234567, "<invalid instruction>", None),
            entry(0x401040, 1, "mov eax, dword ptr [rax + 8]", Some(("libc.so.6", 0x2a))),
        ];
        let rows = parse_report(&format_report(&entries)).unwrap();
        assert_eq!(
            rows,
            vec![
                ReportRow {
                    count: 1234567,
                    address: 0x7f00_0000_1234,
                    disassembly: "<invalid instruction>".to_string(),
                    module: "-".to_string(),
                },
                ReportRow {
                    count: 1,
                    address: 0x401040,
                    disassembly: "mov eax, dword ptr [rax + 8]".to_string(),
                    module: "libc.so.6+0x2a".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_report_rejects_garbage() {
        assert!(parse_report("").is_err());
        assert!(parse_report("hello\n").is_err());
        let truncated = "Count     Address             Disassembly  Module\n----\n";
        assert!(matches!(
            parse_report(truncated),
            Err(ExportError::Malformed { .. })
        ));
    }

    #[test]
    fn test_export_to_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("report.txt");
        assert!(matches!(
            export_to_text(&path, &[]),
            Err(ExportError::Io { .. })
        ));
    }
}
