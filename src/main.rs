use agent::SampleLoop;
use backtrace::Backtrace;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::Config;
use ringlog::*;
use store::MetricStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod agent;
mod config;
mod exporter;
mod store;

struct Args {
    config: Option<PathBuf>,
    verbose: u8,
}

impl TryFrom<ArgMatches> for Args {
    type Error = String;

    fn try_from(args: ArgMatches) -> Result<Self, String> {
        Ok(Args {
            config: args.get_one::<PathBuf>("CONFIG").cloned(),
            verbose: *args.get_one::<u8>("VERBOSE").unwrap_or(&0),
        })
    }
}

fn command() -> Command {
    Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Attributes GPU and disk I/O usage to scheduler jobs and exports it for Prometheus")
        .arg(
            Arg::new("CONFIG")
                .help("Path to the TOML configuration file")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Set)
                .index(1),
        )
        .arg(
            Arg::new("VERBOSE")
                .long("verbose")
                .short('v')
                .help("Increase verbosity, may be repeated")
                .action(ArgAction::Count),
        )
}

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    let args = match Args::try_from(command().get_matches()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    let config = Arc::new(config);

    let level = raise(config.log().level(), args.verbose);

    let debug_output: Box<dyn Output> = Box::new(Stderr::new());

    let debug_log = if level <= Level::Info {
        LogBuilder::new().format(ringlog::default_format)
    } else {
        LogBuilder::new()
    }
    .output(debug_output)
    .build();

    let debug_log = match debug_log {
        Ok(log) => log,
        Err(e) => {
            eprintln!("failed to initialize log: {e:?}");
            std::process::exit(1);
        }
    };

    let mut log = MultiLogBuilder::new()
        .level_filter(level.to_level_filter())
        .default(debug_log)
        .build()
        .start();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gpu-job-exporter")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to launch async runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = log.flush();
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    }) {
        error!("failed to install signal handler: {e}");
        std::process::exit(1);
    }

    if let Err(e) = runtime.block_on(run(config, shutdown_rx)) {
        error!("{e}");
        // give the flush task a chance to drain the log
        std::thread::sleep(Duration::from_millis(100));
        std::process::exit(1);
    }

    info!("shutdown complete");
    std::thread::sleep(Duration::from_millis(100));
}

async fn run(config: Arc<Config>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let store = MetricStore::new();

    let listen = config.general().listen();
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen on {listen}: {e}"))?;

    let sample_loop = SampleLoop::new(config, store.clone());
    let sampling = tokio::spawn(sample_loop.run(shutdown.clone()));

    exporter::serve(listener, store, shutdown).await?;

    sampling.await?;

    Ok(())
}

/// Raises a log level by one step per `-v`, saturating at trace.
fn raise(level: Level, steps: u8) -> Level {
    (0..steps).fold(level, |level, _| match level {
        Level::Error => Level::Warn,
        Level::Warn => Level::Info,
        Level::Info => Level::Debug,
        Level::Debug | Level::Trace => Level::Trace,
    })
}
