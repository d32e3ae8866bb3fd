//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// 監視エンジンが利用するプロセスメモリアクセス
///
/// テストでは実プロセスの代わりにメモリ上の実装を差し込みます。
pub trait ProcessMemory: Send + Sync {
    /// `address` から最大 `length` バイトを読み取る
    ///
    /// 領域の終端にかかる場合は短い結果を返します。1バイトも読めなければエラー。
    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>>;

    /// アドレスを含むモジュールを取得する
    fn owning_module(&self, address: u64) -> Option<ModuleInfo>;

    /// 対象プロセスが64bitか
    fn is_64bit(&self) -> bool;
}

/// モジュール情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryMapping {
    /// アドレスがこのマッピング内にあるか
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// /proc/pid/maps の1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    let perms = parts[1];
    let offset = usize::from_str_radix(parts[2], 16).ok()?;

    // パス名は空白を含むことがある
    let path = if parts.len() > 5 {
        Some(parts[5..].join(" "))
    } else {
        None
    };

    Some(MemoryMapping {
        start,
        end,
        readable: perms.chars().next() == Some('r'),
        writable: perms.chars().nth(1) == Some('w'),
        executable: perms.chars().nth(2) == Some('x'),
        offset,
        path,
    })
}

/// マッピング一覧からアドレスを含むモジュールを求める
///
/// 同じパス名を持つマッピング全体を1つのモジュールとして扱います。
pub fn module_from_mappings(mappings: &[MemoryMapping], address: u64) -> Option<ModuleInfo> {
    let addr = address as usize;
    let path = mappings.iter().find(|m| m.contains(addr))?.path.as_ref()?;

    let segments = mappings.iter().filter(|m| m.path.as_ref() == Some(path));
    let base = segments.clone().map(|m| m.start).min()?;
    let end = segments.map(|m| m.end).max()?;

    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path.as_str())
        .to_string();

    Some(ModuleInfo {
        name,
        base: base as u64,
        size: (end - base) as u64,
    })
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
    is_64bit: bool,
}

impl Memory {
    /// メモリアクセスを作成する
    ///
    /// 実行ファイルのELFヘッダから対象のビット幅を判定します。
    /// 判定できない場合はホストと同じビット幅とみなします。
    pub fn new(pid: i32) -> Self {
        let is_64bit = detect_bitness(pid).unwrap_or_else(|e| {
            tracing::debug!(pid, error = %e, "Could not detect target bitness, assuming host");
            cfg!(target_pointer_width = "64")
        });
        Self {
            pid: Pid::from_raw(pid),
            is_64bit,
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// 読めるところまで読み取る（最大 `size` バイト）
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read_up_to(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let data = match self.read_via_proc_mem(addr, size) {
            Ok(data) => data,
            Err(e) => {
                let eio = e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.raw_os_error() == Some(nix::libc::EIO));
                if !eio {
                    return Err(e);
                }
                self.read_via_ptrace(addr, size)?
            }
        };
        if data.is_empty() {
            return Err(anyhow::anyhow!("Address 0x{:x} is not readable", addr));
        }
        Ok(data)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    ///
    /// 未マッピング領域に達した時点で、それまでに読めた分を返します。
    fn read_via_proc_mem(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        let mut buffer = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match file.read_at(&mut buffer[filled..], (addr + filled) as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if filled == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    /// トレーサースレッドから、停止中のスレッドに対してのみ成功します。
    /// 途中で失敗した場合はそれまでに読めた分を返します。
    fn read_via_ptrace(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset) as *mut std::ffi::c_void;
            let word = match ptrace::read(self.pid, word_addr) {
                Ok(word) => word,
                Err(_) if !data.is_empty() => break,
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to read via ptrace at 0x{:x}: {}",
                        addr + offset,
                        e
                    ))
                }
            };

            let bytes = word.to_ne_bytes();
            let remaining = size - offset;
            let copy_size = remaining.min(word_size);

            data.extend_from_slice(&bytes[..copy_size]);
        }

        data.truncate(size);
        Ok(data)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = parse_maps_line(&line?) {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// 指定されたアドレスが有効なメモリマッピング内にあるかチェックする
    pub fn is_mapped(&self, addr: usize) -> Result<bool> {
        let mappings = self.get_mappings()?;
        Ok(mappings.iter().any(|m| m.contains(addr)))
    }
}

impl ProcessMemory for Memory {
    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        self.read_up_to(address as usize, length)
    }

    fn owning_module(&self, address: u64) -> Option<ModuleInfo> {
        let mappings = self.get_mappings().ok()?;
        module_from_mappings(&mappings, address)
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }
}

/// /proc/pid/exe のELFヘッダからビット幅を判定する
fn detect_bitness(pid: i32) -> Result<bool> {
    let exe_path = format!("/proc/{}/exe", pid);
    let mut header = [0u8; 64];
    File::open(&exe_path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map_err(|e| anyhow::anyhow!("Failed to read ELF header of {}: {}", exe_path, e))?;

    match object::FileKind::parse(&header[..])? {
        object::FileKind::Elf64 => Ok(true),
        object::FileKind::Elf32 => Ok(false),
        kind => Err(anyhow::anyhow!("Unsupported executable format: {:?}", kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a01000 r--p 00000000 08:01 1234 /usr/bin/watch target
55d0c0a01000-55d0c0a03000 r-xp 00001000 08:01 1234 /usr/bin/watch target
55d0c0a03000-55d0c0a04000 rw-p 00003000 08:01 1234 /usr/bin/watch target
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0 [heap]
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0";

    fn mappings() -> Vec<MemoryMapping> {
        MAPS.lines().filter_map(parse_maps_line).collect()
    }

    #[test]
    fn test_parse_maps_line() {
        let maps = mappings();
        assert_eq!(maps.len(), 5);
        assert_eq!(maps[1].start, 0x55d0c0a01000);
        assert!(maps[1].executable && !maps[1].writable);
        assert_eq!(maps[1].offset, 0x1000);
        assert_eq!(maps[1].path.as_deref(), Some("/usr/bin/watch target"));
        assert_eq!(maps[4].path, None);
    }

    #[test]
    fn test_module_from_mappings() {
        let maps = mappings();
        let module = module_from_mappings(&maps, 0x55d0c0a01234).unwrap();
        assert_eq!(module.name, "watch target");
        assert_eq!(module.base, 0x55d0c0a00000);
        assert_eq!(module.size, 0x4000);

        let heap = module_from_mappings(&maps, 0x55d0c1000010).unwrap();
        assert_eq!(heap.name, "[heap]");

        // 無名マッピングはモジュールを持たない
        assert!(module_from_mappings(&maps, 0x7ffd00000010).is_none());
        assert!(module_from_mappings(&maps, 0x10).is_none());
    }

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = Memory::new(std::process::id() as i32);
        let bytes = memory
            .read_up_to(&value as *const u64 as usize, 8)
            .unwrap();
        assert_eq!(bytes, value.to_ne_bytes());
        assert_eq!(memory.is_64bit(), cfg!(target_pointer_width = "64"));
    }
}
