use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracebuf::control::parse_ulong;
use tracebuf::{
    DefaultFormatter, OverflowPolicy, ReadMode, Record, TraceBuffer, TraceConfig, TraceControl,
    TraceError,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Exercise a multi-channel ordered trace buffer.
#[derive(Parser)]
#[command(name = "tracectl", version, about)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error, off, or a directive
    /// list); `RUST_LOG` takes precedence when set.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run producers and print the merged trace to stdout.
    Demo(RunArgs),
    /// Run producers flat out and verify ordering and loss accounting.
    Stress(RunArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// JSON configuration file; flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of channels, one producer thread each.
    #[arg(long)]
    channels: Option<usize>,

    /// Bytes per channel (decimal, 0x hex or 0 octal).
    #[arg(long)]
    capacity: Option<String>,

    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Floor re-probe interval in microseconds.
    #[arg(long)]
    poll_interval_us: Option<u64>,

    /// Messages written by each producer.
    #[arg(short, long, default_value_t = 1000)]
    messages: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    Overwrite,
    Drop,
}

impl From<Policy> for OverflowPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Overwrite => OverflowPolicy::Overwrite,
            Policy::Drop => OverflowPolicy::Drop,
        }
    }
}

impl RunArgs {
    fn load_config(&self) -> Result<TraceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => TraceConfig::default(),
        };

        if let Some(channels) = self.channels {
            config.channels = channels;
        }
        if let Some(capacity) = &self.capacity {
            config.capacity = parse_ulong(capacity)
                .with_context(|| format!("invalid capacity {capacity:?}"))?;
        }
        if let Some(policy) = self.policy {
            config.policy = policy.into();
        }
        if let Some(interval) = self.poll_interval_us {
            config.poll_interval_us = interval;
        }
        config.validate().context("invalid trace configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Cmd::Version = cli.command {
        println!("tracectl {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    setup_logging(&cli.log_level)?;

    match cli.command {
        Cmd::Demo(args) => demo(&args),
        Cmd::Stress(args) => stress(&args),
        Cmd::Version => Ok(()),
    }
}

/// Install a stderr subscriber. Its `log` bridge also captures the
/// library's `log` records.
fn setup_logging(level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log_filter(level)?,
    };

    FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing log subscriber: {err}"))
}

fn log_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))
}

/// Start one producer thread per channel, each writing `messages` records.
fn spawn_producers(
    buffer: &Arc<TraceBuffer>,
    messages: u32,
    payload: fn(usize, u32) -> Vec<u8>,
) -> Vec<thread::JoinHandle<Result<(), TraceError>>> {
    (0..buffer.channels())
        .map(|channel| {
            let buffer = Arc::clone(buffer);
            thread::spawn(move || {
                for seq in 0..messages {
                    buffer.write(channel, &payload(channel, seq))?;
                }
                Ok(())
            })
        })
        .collect()
}

fn join_producers(producers: Vec<thread::JoinHandle<Result<(), TraceError>>>) -> Result<()> {
    for producer in producers {
        match producer.join() {
            Ok(result) => result.context("producer failed")?,
            Err(_) => bail!("producer thread panicked"),
        }
    }
    Ok(())
}

fn demo(args: &RunArgs) -> Result<()> {
    let config = args.load_config()?;
    let buffer = Arc::new(TraceBuffer::new(&config)?);
    let control = TraceControl::new(Arc::clone(&buffer));
    let cancel = buffer.cancel_handle();
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let done = Arc::clone(&done);
        let mut file = control.open_trace(ReadMode::Blocking);
        thread::spawn(move || -> io::Result<()> {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let mut chunk = [0u8; 4096];
            loop {
                match file.read(&mut chunk) {
                    Ok(n) => out.write_all(&chunk[..n])?,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        if done.load(Ordering::Acquire) {
                            return out.flush();
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    };

    let producers = spawn_producers(&buffer, args.messages, |channel, seq| {
        format!("producer {channel} message {seq}").into_bytes()
    });
    join_producers(producers)?;

    done.store(true, Ordering::Release);
    // A cancel only reaches a read in flight; repeat until the consumer
    // has seen one.
    while !consumer.is_finished() {
        cancel.cancel();
        thread::sleep(Duration::from_millis(10));
    }
    match consumer.join() {
        Ok(result) => result.context("writing trace to stdout")?,
        Err(_) => bail!("consumer thread panicked"),
    }

    // Writers have stopped: whatever the consumer left behind is ready now.
    let mut stdout = io::stdout().lock();
    control.dump(&mut stdout, &DefaultFormatter)?;
    stdout.flush()?;

    tracing::info!("demo finished");
    eprint!("lost messages: {}", control.lost_messages());
    Ok(())
}

fn stress_payload(channel: usize, seq: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&(channel as u32).to_le_bytes());
    payload.extend_from_slice(&seq.to_le_bytes());
    payload
}

/// Ordering checker fed one record at a time.
struct OrderCheck {
    last_ts: u64,
    last_seq: Vec<Option<u32>>,
    delivered: u64,
    violations: u64,
}

impl OrderCheck {
    fn new(channels: usize) -> Self {
        Self {
            last_ts: 0,
            last_seq: vec![None; channels],
            delivered: 0,
            violations: 0,
        }
    }

    fn observe(&mut self, record: &Record) {
        self.delivered += 1;
        if record.timestamp < self.last_ts {
            tracing::error!(
                "timestamp went backwards: {} after {} (channel {})",
                record.timestamp,
                self.last_ts,
                record.channel
            );
            self.violations += 1;
        }
        self.last_ts = record.timestamp;

        let bytes = record.payload();
        if bytes.len() != 8 {
            self.violations += 1;
            return;
        }
        let seq = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let slot = &mut self.last_seq[record.channel];
        if slot.is_some_and(|prev| seq <= prev) {
            tracing::error!("channel {} delivered seq {} after {:?}", record.channel, seq, slot);
            self.violations += 1;
        }
        *slot = Some(seq);
    }
}

fn stress(args: &RunArgs) -> Result<()> {
    let config = args.load_config()?;
    let buffer = Arc::new(TraceBuffer::new(&config)?);
    let mut check = OrderCheck::new(config.channels);
    let start = Instant::now();

    let producers = spawn_producers(&buffer, args.messages, stress_payload);
    while producers.iter().any(|p| !p.is_finished()) {
        match buffer.read_oldest(false) {
            Ok(record) => check.observe(&record),
            Err(TraceError::Empty) => thread::yield_now(),
            Err(err) => return Err(err.into()),
        }
    }
    join_producers(producers)?;

    loop {
        match buffer.read_oldest(false) {
            Ok(record) => check.observe(&record),
            Err(TraceError::Empty) => break,
            Err(err) => return Err(err.into()),
        }
    }

    let attempted = config.channels as u64 * args.messages as u64;
    let lost = buffer.lost_count();
    println!(
        "channels={} attempted={} delivered={} lost={} elapsed={:?}",
        config.channels,
        attempted,
        check.delivered,
        lost,
        start.elapsed()
    );

    if check.violations > 0 {
        bail!("{} ordering violations", check.violations);
    }
    if check.delivered + lost != attempted {
        bail!(
            "accounting mismatch: delivered {} + lost {} != attempted {}",
            check.delivered,
            lost,
            attempted
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_accepts_levels_and_directives() {
        for level in ["trace", "debug", "info", "warn", "error", "off", "tracebuf=debug"] {
            assert!(log_filter(level).is_ok(), "{level}");
        }
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tracectl",
            "--log-level",
            "debug",
            "stress",
            "--channels",
            "3",
            "--capacity",
            "0x1000",
            "--policy",
            "drop",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        let Cmd::Stress(args) = cli.command else {
            panic!("expected stress");
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.channels, 3);
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.policy, OverflowPolicy::Drop);
        assert_eq!(args.messages, 1000);
    }

    #[test]
    fn bad_capacity_is_reported() {
        let cli = Cli::try_parse_from(["tracectl", "demo", "--capacity", "lots"]).unwrap();
        let Cmd::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert!(args.load_config().is_err());
    }
}
