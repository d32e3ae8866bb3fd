//! Kanshi CLI - コマンドラインインターフェース
//!
//! 他プロセスのメモリアドレスに触れる命令を調べる kanshi のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use kanshi_core::export::format_report;
use kanshi_core::{
    AccessEntry, Command, EngineConfig, EndReason, InterceptionMode, SessionObserver,
    SessionStats, WatchEngine, WatchSpec,
};
use kanshi_target::{Memory, PtraceMonitor, SlotPool};
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Kanshi - Memory Access Tracker
#[derive(Parser)]
#[command(name = "kanshi")]
#[command(version = "0.1.0")]
#[command(about = "Find the instructions that read or write a memory address in another process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: TargetCommand,

    /// Start watches with hardware breakpoints instead of page guards
    #[arg(long, global = true)]
    hardware: bool,

    /// Refresh interval of the hit summary in milliseconds
    #[arg(long, global = true, default_value_t = 250)]
    refresh_ms: u64,

    /// Seconds of page guard silence before offering hardware breakpoints
    #[arg(long, global = true, default_value_t = 15)]
    grace_secs: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum TargetCommand {
    /// Launch an executable and watch it
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

/// 監視対象と、それを操作するエンジン
struct Target {
    pid: i32,
    memory: Arc<Memory>,
    engine: WatchEngine,
    child: Option<Child>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("Kanshi - Memory Access Tracker");
    println!("Version 0.1.0");
    println!();

    let config = engine_config(&cli);
    let mut target = init_target(cli.command, config)?;
    run_repl(&target)?;

    if target.engine.state().is_monitoring() {
        target.engine.stop()?;
    }
    if let Some(mut child) = target.child.take() {
        let _ = child.kill();
        let _ = child.wait();
    }

    Ok(())
}

/// ログ出力を初期化する（RUST_LOG、未設定なら warn）
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        refresh_interval: Duration::from_millis(cli.refresh_ms.max(1)),
        escalation_grace: Duration::from_secs(cli.grace_secs),
        initial_mode: if cli.hardware {
            InterceptionMode::HardwareBreakpoint
        } else {
            InterceptionMode::PageGuard
        },
        ..EngineConfig::default()
    }
}

/// 対象プロセスを起動またはアタッチし、エンジンを組み立てる
fn init_target(command: TargetCommand, config: EngineConfig) -> Result<Target> {
    let (pid, child) = match command {
        TargetCommand::Run { binary, args } => {
            println!("Launching: {}", binary);
            let child = std::process::Command::new(&binary)
                .args(&args)
                .spawn()
                .map_err(|e| anyhow::anyhow!("Failed to launch {}: {}", binary, e))?;
            let pid = child.id() as i32;
            println!("Process started with pid {}", pid);
            (pid, Some(child))
        }
        TargetCommand::Attach { pid } => {
            if !Path::new(&format!("/proc/{}", pid)).exists() {
                return Err(anyhow::anyhow!("No such process: {}", pid));
            }
            println!("Attaching to process: {}", pid);
            (pid, None)
        }
    };

    let memory = Arc::new(Memory::new(pid));
    let monitor = PtraceMonitor::new(pid, SlotPool::new());
    let engine = WatchEngine::new(memory.clone(), Box::new(monitor), config);
    engine.set_observer(Arc::new(ConsoleObserver::default()));
    info!(pid, "Target ready");
    println!();

    Ok(Target {
        pid,
        memory,
        engine,
        child,
    })
}

/// コンソールに状況を表示するオブザーバ
#[derive(Default)]
struct ConsoleObserver {
    last_total: Mutex<Option<u64>>,
}

impl SessionObserver for ConsoleObserver {
    fn on_render(&self, entries: &[AccessEntry], stats: &SessionStats) {
        let mut last_total = self.last_total.lock();
        if *last_total == Some(stats.total_hits) {
            return;
        }
        *last_total = Some(stats.total_hits);

        let top = entries
            .first()
            .map(|e| format!(", top: 0x{:x} {} ({}x)", e.instruction_address, e.disassembly, e.count))
            .unwrap_or_default();
        println!(
            "[kanshi] {} hit(s), {} instruction(s) shown, {} discarded{}",
            stats.total_hits,
            entries.len(),
            stats.discarded_hits,
            top
        );
    }

    fn on_escalation_offered(&self, silent_for: Duration) {
        println!(
            "[kanshi] No hits with page guards for {}s. Type 'escalate' to switch to hardware breakpoints or 'wait' to keep waiting.",
            silent_for.as_secs()
        );
    }

    fn on_escalated(&self, mode: InterceptionMode) {
        println!("[kanshi] Now monitoring with {}", mode);
    }

    fn on_session_ended(&self, reason: &EndReason) {
        println!("[kanshi] Monitoring ended: {}", reason);
    }
}

/// REPLループを実行する
fn run_repl(target: &Target) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(kanshi) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_command(target, command) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    None => {
                        println!("Unknown command or invalid arguments: {}", line);
                        println!("Type 'help' for available commands");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// コマンドを処理する
fn handle_command(target: &Target, command: Command) -> Result<()> {
    let engine = &target.engine;
    match command {
        Command::Watch {
            address,
            size,
            write_only,
        } => {
            let spec = WatchSpec::new(address, size, write_only)?;
            let mode = engine.start(spec)?;
            println!("Watching {} with {}", spec, mode);
        }
        Command::Stop => {
            engine.stop()?;
            println!(
                "Stopped: {} hit(s) on {} instruction(s)",
                engine.total_hits(),
                engine.unique_count()
            );
        }
        Command::Escalate => {
            engine.accept_escalation()?;
        }
        Command::Wait => {
            engine.decline_escalation();
            println!(
                "Waiting another {}s before offering hardware breakpoints again",
                engine.config().escalation_grace.as_secs()
            );
        }
        Command::Filter(policy) => {
            engine.set_filter_policy(policy);
            println!("Filter: {}", policy);
        }
        Command::List(limit) => handle_list(engine, limit),
        Command::Status => handle_status(target),
        Command::Clear => {
            engine.reset();
            println!("Cleared");
        }
        Command::Export(path) => {
            let count = engine.export_to_text(Path::new(&path))?;
            println!("Exported {} instruction(s) to {}", count, path);
        }
        Command::Read { address, len } => handle_read(target, address, len)?,
        Command::Help => print_help(),
        Command::Quit => {}
    }
    Ok(())
}

fn handle_list(engine: &WatchEngine, limit: Option<usize>) {
    let entries = engine.snapshot();
    if entries.is_empty() {
        println!("No accesses recorded");
        return;
    }
    let shown = limit.unwrap_or(entries.len()).min(entries.len());
    print!("{}", format_report(&entries[..shown]));
    if shown < entries.len() {
        println!("... and {} more", entries.len() - shown);
    }
}

fn handle_status(target: &Target) {
    let engine = &target.engine;
    println!("Process:   {}", target.pid);
    println!("State:     {}", engine.state());
    match engine.watch_spec() {
        Some(spec) => println!("Watch:     {}", spec),
        None => println!("Watch:     -"),
    }
    println!("Filter:    {}", engine.filter_policy());
    println!(
        "Hits:      {} ({} unique, {} discarded, {} raw)",
        engine.total_hits(),
        engine.unique_count(),
        engine.discarded_hits(),
        engine.raw_hits()
    );
    if engine.escalation_pending() {
        println!("Pending:   hardware breakpoint escalation offered");
    }
    if let Some(reason) = engine.last_failure_reason() {
        println!("Last failure: {}", reason);
    }
}

fn handle_read(target: &Target, address: u64, len: usize) -> Result<()> {
    let bytes = target.memory.read_up_to(address as usize, len)?;
    if bytes.len() < len {
        warn!("Short read at 0x{:x}: {} of {} bytes", address, bytes.len(), len);
    }
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!(
            "0x{:016x}  {:<47}  {}",
            address + (i * 16) as u64,
            hex.join(" "),
            ascii
        );
    }
    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!("  watch <addr> [size] [w]  - Watch 1-16 bytes at <addr> (w: writes only)");
    println!("  stop                     - Stop monitoring");
    println!("  escalate, e              - Switch from page guards to hardware breakpoints");
    println!("  wait                     - Decline the escalation offer and keep waiting");
    println!("  filter all|nocmp|arith   - Show all, hide comparisons, or arithmetic only");
    println!("  list, l [n]              - Show the top <n> instructions");
    println!("  status, s                - Show monitoring state and counters");
    println!("  clear                    - Clear the recorded accesses");
    println!("  export <path>            - Write the visible accesses to a text file");
    println!("  read, x <addr> [len]     - Dump target memory");
    println!("  help, h                  - Show this help");
    println!("  quit, q                  - Exit");
}
