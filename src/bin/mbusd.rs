#[macro_use]
extern crate lazy_static;

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use chrono::prelude::*;
use clap::Parser;
use colored::Colorize;
use log::{error, info, trace};
use log::{Level, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

use mbus::broker::Broker;

lazy_static! {
    static ref PID_FILE: Mutex<Option<String>> = Mutex::new(None);
    static ref SOCK_FILES: Mutex<Vec<String>> = Mutex::new(Vec::new());
}

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let s = format!(
                "{}  {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                record.args()
            );
            println!(
                "{}",
                match record.level() {
                    Level::Trace => s.black().dimmed(),
                    Level::Debug => s.dimmed(),
                    Level::Warn => s.yellow().bold(),
                    Level::Error => s.red(),
                    Level::Info => s.normal(),
                }
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

fn set_verbose_logger(filter: LevelFilter) {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(filter))
        .unwrap();
}

#[derive(Parser)]
#[clap(name = "mbusd", about = "mbus message bus broker daemon")]
struct Opts {
    #[clap(
        short = 'B',
        long = "bind",
        required = true,
        help = "Unix socket path or IP:PORT, can be specified multiple times"
    )]
    path: Vec<String>,
    #[clap(short = 'P', long = "pid-file")]
    pid_file: Option<String>,
    #[clap(long = "password", help = "require this password on command.create")]
    password: Option<String>,
    #[clap(short = 'v', help = "Verbose logging")]
    verbose: bool,
    #[clap(short = 'D')]
    daemonize: bool,
    #[clap(long = "log-syslog", help = "Force log to syslog")]
    log_syslog: bool,
    #[clap(short = 'w', default_value = "4")]
    workers: usize,
    #[clap(
        long = "queue-size",
        default_value = "8192",
        help = "outbound frame queue depth, per client"
    )]
    queue_size: usize,
    #[clap(
        long = "max-buf-size",
        default_value = "16777216",
        help = "maximum inbound frame buffer, per client, in bytes"
    )]
    max_buf_size: usize,
}

fn init_logger(opts: &Opts) {
    if opts.verbose {
        set_verbose_logger(LevelFilter::Trace);
        return;
    }
    if (!opts.daemonize || std::env::var("DISABLE_SYSLOG").unwrap_or_else(|_| "0".to_owned()) == "1")
        && !opts.log_syslog
    {
        set_verbose_logger(LevelFilter::Info);
        return;
    }
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: "mbusd".into(),
        pid: 0,
    };
    match syslog::unix(formatter) {
        Ok(logger) => {
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|()| log::set_max_level(LevelFilter::Info))
                .unwrap();
        }
        Err(_) => set_verbose_logger(LevelFilter::Info),
    }
}

async fn write_pid_file(pid_file: Option<String>) {
    let Some(pid_file) = pid_file else { return };
    let pid = std::process::id().to_string();
    tokio::fs::write(&pid_file, pid)
        .await
        .expect("Unable to write pid file");
    info!("created pid file {}", pid_file);
    PID_FILE.lock().await.replace(pid_file);
}

/// Requests an orderly shutdown through the broker's own flag rather than a
/// standalone atomic: `run_until_shutdown` in `main` is the only place that
/// ever decides the process is done.
async fn request_shutdown(broker: &Broker, allow_log: bool) {
    if allow_log {
        trace!("got termination signal");
    }
    broker.request_shutdown();
}

macro_rules! handle_term_signal {
    ($kind: expr, $allow_log: expr, $broker: expr) => {{
        let broker = $broker.clone();
        tokio::spawn(async move {
            trace!("starting handler for {:?}", $kind);
            loop {
                match signal($kind) {
                    Ok(mut v) => {
                        v.recv().await;
                    }
                    Err(e) => {
                        error!("Unable to bind to signal {:?}: {}", $kind, e);
                        break;
                    }
                }
                request_shutdown(&broker, $allow_log).await;
            }
        })
    }};
}

async fn bind_listeners(broker: &Broker, paths: Vec<String>) {
    let mut sock_files = SOCK_FILES.lock().await;
    for path in paths {
        info!("binding at {}", path);
        if path.ends_with(".sock") || path.ends_with(".socket") || path.starts_with('/') {
            broker
                .spawn_unix_server(&path)
                .await
                .expect("Unable to start unix server");
            sock_files.push(path);
        } else {
            broker
                .spawn_tcp_server(&path)
                .await
                .expect("Unable to start tcp server");
        }
    }
}

/// Removes the pid file and any bound Unix socket paths. Called exactly
/// once, after `run_until_shutdown` returns, regardless of which signal (or
/// `command.close`) triggered the shutdown.
async fn cleanup() {
    if let Some(f) = PID_FILE.lock().await.as_ref() {
        trace!("removing pid file {}", f);
        let _r = std::fs::remove_file(f);
    }
    for f in SOCK_FILES.lock().await.iter() {
        trace!("removing sock file {}", f);
        let _r = std::fs::remove_file(f);
    }
}

fn main() {
    let opts: Opts = Opts::parse();
    init_logger(&opts);
    info!(
        "starting mbus broker, {} workers, queue size: {}, max buf size: {}",
        opts.workers, opts.queue_size, opts.max_buf_size
    );
    if opts.daemonize {
        if let Ok(fork::Fork::Child) = fork::daemon(true, false) {
            std::process::exit(0);
        }
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(opts.workers)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        write_pid_file(opts.pid_file).await;

        let broker = Broker::new()
            .set_queue_size(opts.queue_size)
            .set_max_buffer_size(opts.max_buf_size)
            .set_password(opts.password);

        handle_term_signal!(SignalKind::interrupt(), false, broker);
        handle_term_signal!(SignalKind::terminate(), true, broker);

        bind_listeners(&broker, opts.path).await;
        info!("mbus broker started");

        broker.run_until_shutdown().await;
        info!("terminating");
        cleanup().await;
    });
}
