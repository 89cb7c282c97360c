use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use accompanist::inference::{DriverSettings, InferenceDriver, MarkovModel};
use accompanist::midi::{ChannelRouter, IoLoop, device};
use accompanist::timing::TickClock;
use accompanist::tokens::TimeCodec;
use accompanist::{Error, GenerationSession, Result, RuntimeConfig, spawn_engine, watch_sampling};
use arc_swap::ArcSwap;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    list_ports: bool,
    write_config: Option<PathBuf>,
    write_vocab: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    for arg in std::env::args().skip(1) {
        if arg == "--list-ports" {
            args.list_ports = true;
        } else if let Some(path) = arg.strip_prefix("--config=") {
            args.config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--write-config=") {
            args.write_config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--write-vocab=") {
            args.write_vocab = Some(PathBuf::from(path));
        } else {
            return Err(Error::Config(format!(
                "unknown argument '{arg}' (expected --config=PATH, --list-ports, --write-config=PATH or --write-vocab=PATH)"
            )));
        }
    }
    Ok(args)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, fatal = e.is_fatal(), "accompanist stopped");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = parse_args()?;

    if args.list_ports {
        let listing = device::list_ports()?;
        println!("MIDI inputs:");
        for (i, name) in listing.inputs.iter().enumerate() {
            println!("  {i}: {name}");
        }
        println!("MIDI outputs:");
        for (i, name) in listing.outputs.iter().enumerate() {
            println!("  {i}: {name}");
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    config.validate()?;
    if let Some(path) = &args.write_config {
        config.save(path)?;
        tracing::info!(path = %path.display(), "config written");
        return Ok(());
    }

    let vocab = Arc::new(config.load_vocabulary()?);
    if let Some(path) = &args.write_vocab {
        vocab.save(path)?;
        tracing::info!(path = %path.display(), symbols = vocab.len(), "vocabulary written");
        return Ok(());
    }

    tracing::info!(
        window = config.window_limit,
        truncation_fraction = config.truncation_fraction,
        structural_retention = config.structural_token_retention,
        cc_filter = config.cc_filter,
        vocabulary = vocab.len(),
        "starting session"
    );
    if !config.cc_filter {
        tracing::warn!("cc_filter is off, but controller and pitch-bend input is never encoded");
    }

    let sampling = Arc::new(ArcSwap::from_pointee(config.sampling.clone()));
    let _watcher = match &args.config {
        Some(path) => Some(watch_sampling(path, sampling.clone())?),
        None => None,
    };

    let session = GenerationSession::new(&config, &vocab)?;
    let driver = InferenceDriver::new(
        MarkovModel::new(&vocab),
        TimeCodec::new(vocab.clone()),
        sampling,
        DriverSettings::from_config(&config),
    )?;

    let (_inputs, sources) = device::connect_inputs(&config.ports, config.ring_capacity)?;
    let output = device::connect_output(config.ports.output.as_deref())?;

    let tick_counter = Arc::new(AtomicU64::new(0));
    let engine = spawn_engine(session, driver, tick_counter.clone(), config.io_tick());
    let clock = TickClock::new(config.bpm, config.ticks_per_quarter, Instant::now());
    let mut io = IoLoop::new(
        sources,
        clock,
        ChannelRouter::new(config.ring_capacity),
        output,
        engine.command_tx.clone(),
        engine.update_rx.clone(),
        tick_counter,
        config.io_tick(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_enter = stop.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        stop_on_enter.store(true, Ordering::Relaxed);
    });

    println!("Listening for MIDI. Press Enter to quit.");
    io.run(&stop);
    let _ = engine.thread.join();
    Ok(())
}
