//! kanshi を手で試すための監視対象
//!
//! グローバル変数を読み、比較し、加算し、書き戻すループを回します。
//! 表示されたアドレスを `watch` に渡してください。

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

static SCORE: AtomicU32 = AtomicU32::new(0);
static LIVES: AtomicU32 = AtomicU32::new(3);

#[inline(never)]
fn tick(round: u32) {
    // 読み込みと比較
    if SCORE.load(Ordering::Relaxed) >= 1000 {
        SCORE.store(0, Ordering::Relaxed);
        LIVES.fetch_sub(1, Ordering::Relaxed);
    }
    // 加算（read-modify-write）
    SCORE.fetch_add(10, Ordering::Relaxed);
    if round % 7 == 0 {
        // 書き込み
        SCORE.store(SCORE.load(Ordering::Relaxed) / 2, Ordering::Relaxed);
    }
}

fn main() {
    println!("pid:   {}", std::process::id());
    println!("score: {:p}", &SCORE);
    println!("lives: {:p}", &LIVES);

    let mut round: u32 = 0;
    loop {
        round = round.wrapping_add(1);
        tick(round);
        if round % 10 == 0 {
            println!(
                "round {}: score={} lives={}",
                round,
                SCORE.load(Ordering::Relaxed),
                LIVES.load(Ordering::Relaxed)
            );
        }
        thread::sleep(Duration::from_millis(100));
    }
}
