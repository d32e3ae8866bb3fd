//! レジスタアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::ffi::c_void;

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する（対象はスレッド単位）
    pub fn new(tid: i32) -> Self {
        Self {
            pid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<nix::libc::user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// struct user 内のデバッグレジスタのオフセット
    fn debug_register_offset(index: usize) -> *mut c_void {
        let base = std::mem::offset_of!(nix::libc::user, u_debugreg);
        (base + index * std::mem::size_of::<u64>()) as *mut c_void
    }

    /// デバッグレジスタ（DR0〜DR7）を読み取る
    pub fn read_debug_register(&self, index: usize) -> Result<u64> {
        let value = nix::sys::ptrace::read_user(self.pid, Self::debug_register_offset(index))
            .map_err(|e| anyhow::anyhow!("Failed to read DR{} of {}: {}", index, self.pid, e))?;
        Ok(value as u64)
    }

    /// デバッグレジスタ（DR0〜DR7）に書き込む
    pub fn write_debug_register(&self, index: usize, value: u64) -> Result<()> {
        nix::sys::ptrace::write_user(
            self.pid,
            Self::debug_register_offset(index),
            value as nix::libc::c_long,
        )
        .map_err(|e| anyhow::anyhow!("Failed to write DR{} of {}: {}", index, self.pid, e))?;
        Ok(())
    }

    /// DR6（デバッグステータス）を読み取ってクリアする
    pub fn take_debug_status(&self) -> Result<u64> {
        let dr6 = self.read_debug_register(6)?;
        self.write_debug_register(6, 0)?;
        Ok(dr6)
    }
}
