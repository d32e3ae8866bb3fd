//! 対話コマンド

use crate::classify::FilterPolicy;
use crate::parse::{parse_address, parse_size};

/// `watch` で省略されたときのバイト数
pub const DEFAULT_WATCH_SIZE: usize = 4;
/// `read` で省略されたときのバイト数
pub const DEFAULT_READ_LEN: usize = 64;

/// 対話コマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 監視を開始
    Watch {
        address: u64,
        size: usize,
        write_only: bool,
    },
    /// 監視を停止
    Stop,
    /// ハードウェア方式へ切り替え（提案の受け入れ）
    Escalate,
    /// 切り替えの提案を断る
    Wait,
    /// 表示フィルタを変更
    Filter(FilterPolicy),
    /// 集計結果を表示（上位n件）
    List(Option<usize>),
    /// 状態表示
    Status,
    /// 集計結果を消去
    Clear,
    /// 集計結果をファイルに出力
    Export(String),
    /// メモリをダンプ
    Read { address: u64, len: usize },
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "watch" | "w" => {
                let address = parse_address(parts.get(1)?).ok()?;
                let mut size = DEFAULT_WATCH_SIZE;
                let mut write_only = false;
                for arg in &parts[2..] {
                    match *arg {
                        "w" | "write" => write_only = true,
                        other => size = parse_size(other).ok()?,
                    }
                }
                Some(Command::Watch {
                    address,
                    size,
                    write_only,
                })
            }
            "stop" => Some(Command::Stop),
            "escalate" | "e" => Some(Command::Escalate),
            "wait" => Some(Command::Wait),
            "filter" | "f" => parts
                .get(1)
                .and_then(|policy| policy.parse().ok())
                .map(Command::Filter),
            "list" | "l" => match parts.get(1) {
                Some(n) => n.parse().ok().map(|n| Command::List(Some(n))),
                None => Some(Command::List(None)),
            },
            "status" | "s" => Some(Command::Status),
            "clear" => Some(Command::Clear),
            "export" => {
                if parts.len() > 1 {
                    Some(Command::Export(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "read" | "x" => {
                let address = parse_address(parts.get(1)?).ok()?;
                let len = match parts.get(2) {
                    Some(len) => parse_size(len).ok()?,
                    None => DEFAULT_READ_LEN,
                };
                Some(Command::Read { address, len })
            }
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch() {
        assert_eq!(
            Command::parse("watch 0x404010"),
            Some(Command::Watch {
                address: 0x404010,
                size: 4,
                write_only: false
            })
        );
        assert_eq!(
            Command::parse("watch 0x404010 8 w"),
            Some(Command::Watch {
                address: 0x404010,
                size: 8,
                write_only: true
            })
        );
        assert_eq!(
            Command::parse("w 4198400 write"),
            Some(Command::Watch {
                address: 0x401000,
                size: 4,
                write_only: true
            })
        );
        assert_eq!(Command::parse("watch"), None);
        assert_eq!(Command::parse("watch nowhere"), None);
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            Command::parse("filter nocmp"),
            Some(Command::Filter(FilterPolicy::ExcludeComparisons))
        );
        assert_eq!(
            Command::parse("f arith"),
            Some(Command::Filter(FilterPolicy::ArithmeticOnly))
        );
        assert_eq!(Command::parse("filter"), None);
        assert_eq!(Command::parse("filter loads"), None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("escalate"), Some(Command::Escalate));
        assert_eq!(Command::parse("wait"), Some(Command::Wait));
        assert_eq!(Command::parse("list"), Some(Command::List(None)));
        assert_eq!(Command::parse("list 5"), Some(Command::List(Some(5))));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("clear"), Some(Command::Clear));
        assert_eq!(
            Command::parse("export /tmp/hits report.txt"),
            Some(Command::Export("/tmp/hits report.txt".to_string()))
        );
        assert_eq!(
            Command::parse("read 0x1000"),
            Some(Command::Read {
                address: 0x1000,
                len: DEFAULT_READ_LEN
            })
        );
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse("continue"), None);
    }
}
