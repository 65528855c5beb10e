use std::fs::OpenOptions;

use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod app;
mod archive;
mod cli;
mod config;
mod error;
mod fixup;
mod lock;
mod mapper;
mod monitor;
mod progress;
mod rclone;
mod sanitize;
mod scratch;
mod shutdown;
mod status;
mod store;
mod unzipper;
mod util;
mod zipper;

pub use error::BrigadeError;

fn main() {
    let cli = cli::Cli::parse();
    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ 配置错误: {:#}", e);
            std::process::exit(2);
        }
    };
    init_tracing(&config, cli.debug);

    let app = match app::App::init(config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("❌ 启动失败: {:#}", e);
            std::process::exit(2);
        }
    };

    let res = match cli.command {
        cli::Commands::Map {} => mapper::run(&app),
        cli::Commands::Zip {} => zipper::run(&app),
        cli::Commands::Unzip {} => unzipper::run(&app),
        cli::Commands::Fix {} => fixup::run(&app),
        cli::Commands::Status {} => status::run(&app),
    };

    match res {
        Ok(()) => {}
        Err(e) => {
            // 锁竞争等致命启动错误退非零；正常中断保存进度后退 0
            // — lock contention exits non-zero; a clean shutdown exits 0
            if let Some(be) = e.downcast_ref::<BrigadeError>()
                && be.is_shutdown()
            {
                println!("⚠️ 已按请求终止，进度已保存");
                return;
            }
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize tracing into `<WORK_DIR>/logs/debug.log` only; the console is
/// reserved for the status table. If the log file cannot be opened, tracing
/// stays uninitialized and a single warning goes to stderr.
fn init_tracing(cfg: &config::Config, debug: bool) {
    let logs_dir = cfg.work_dir.join("logs");
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("debug.log");
    let level_str = if debug { "debug" } else { "warn" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background thread remains alive for
            // the duration of the process; dropping it would stop the writer
            // thread and lose buffered logs.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}
