mod profile;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;
use uartkit_core::{DriverOptions, SerialPortBackend, UartDriver};

use crate::profile::Profile;

/// Talk to a serial line through the uartkit driver.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Profile file; defaults to <config dir>/uartkit/profiles.json
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports on this machine
    List,
    /// Print the stored profiles
    Profiles,
    /// Transmit DATA, retrying partial writes
    Send {
        #[command(flatten)]
        line: LineArgs,
        /// Treat DATA as hex, e.g. `4869`
        #[arg(long)]
        hex: bool,
        data: String,
    },
    /// Read up to COUNT bytes and print them as hex
    Recv {
        #[command(flatten)]
        line: LineArgs,
        #[arg(short = 'n', long, default_value_t = 64)]
        count: usize,
        /// Milliseconds to wait for the first byte
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Print everything received until the line is idle for IDLE ms
    Monitor {
        #[command(flatten)]
        line: LineArgs,
        #[arg(long)]
        idle: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct LineArgs {
    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    port: Option<String>,
    /// Start from a stored profile; flags override its fields
    #[arg(long)]
    profile: Option<String>,
    #[arg(short, long)]
    baud: Option<u32>,
    #[arg(long)]
    data_bits: Option<u8>,
    /// Parity bit on or off, e.g. `--parity false`
    #[arg(long)]
    parity: Option<bool>,
    #[arg(long)]
    stop_bits: Option<u8>,
    /// polling, interrupt or dma
    #[arg(short, long)]
    mode: Option<String>,
}

impl LineArgs {
    fn resolve(&self, profiles: Option<&PathBuf>) -> Result<Profile> {
        let mut p = match &self.profile {
            Some(name) => {
                let path = profiles
                    .cloned()
                    .or_else(profile::default_path)
                    .context("no config directory for profiles")?;
                profile::load(&path, name)?
            }
            None => Profile::default(),
        };
        if let Some(port) = &self.port {
            p.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            p.baud_rate = baud;
        }
        if let Some(bits) = self.data_bits {
            p.data_bits = bits;
        }
        if let Some(parity) = self.parity {
            p.parity = parity;
        }
        if let Some(bits) = self.stop_bits {
            p.stop_bits = bits;
        }
        if let Some(mode) = &self.mode {
            p.mode = mode.clone();
        }
        Ok(p)
    }

    fn open(&self, profiles: Option<&PathBuf>) -> Result<UartDriver<SerialPortBackend>> {
        let p = self.resolve(profiles)?;
        let port = p.port.clone().context("no port given (use --port or a profile)")?;
        let options = DriverOptions {
            read_timeout: p.read_timeout(),
            ..Default::default()
        };
        let uart = UartDriver::with_options(0, SerialPortBackend::new(&port), options);
        uart.configure(p.line_config())?;
        uart.open(p.strategy()?).with_context(|| format!("opening {port}"))?;
        log::info!("{port}: {} baud, {:?}", p.baud_rate, uart.strategy());
        Ok(uart)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter(None, level_for(cli.verbose));
    builder.init();
    let profiles = cli.profiles.as_ref();

    match &cli.command {
        Command::List => list_ports(),
        Command::Profiles => show_profiles(profiles),
        Command::Send { line, hex: as_hex, data } => {
            let bytes = if *as_hex {
                hex::decode(data.replace(' ', "")).context("DATA is not valid hex")?
            } else {
                data.clone().into_bytes()
            };
            let uart = line.open(profiles)?;
            send_all(&uart, &bytes)?;
            uart.close()?;
            println!("Wrote {} bytes.", bytes.len());
            Ok(())
        }
        Command::Recv { line, count, timeout } => {
            let uart = line.open(profiles)?;
            let got = uart.read(*count, timeout.map(Duration::from_millis))?;
            uart.close()?;
            println!("Read {} bytes: {}", got.len(), hex::encode_upper(&got));
            Ok(())
        }
        Command::Monitor { line, idle } => {
            let uart = line.open(profiles)?;
            monitor(&uart, idle.map(Duration::from_millis))?;
            uart.close()?;
            Ok(())
        }
    }
}

fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn list_ports() -> Result<()> {
    for p in uartkit_core::list_ports() {
        println!("{}", p.label());
    }
    Ok(())
}

fn show_profiles(path: Option<&PathBuf>) -> Result<()> {
    let path = path
        .cloned()
        .or_else(profile::default_path)
        .context("no config directory for profiles")?;
    let all = profile::load_all(&path)?;
    println!("{}", serde_json::to_string_pretty(&all)?);
    Ok(())
}

fn send_all(uart: &UartDriver<SerialPortBackend>, mut data: &[u8]) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !data.is_empty() {
        let n = uart.write(data)?;
        data = &data[n..];
        if n == 0 {
            if Instant::now() >= deadline {
                bail!("line stopped accepting data with {} bytes left", data.len());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

fn monitor(uart: &UartDriver<SerialPortBackend>, idle: Option<Duration>) -> Result<()> {
    let stdout = std::io::stdout();
    loop {
        let chunk = uart.read(4096, idle)?;
        if chunk.is_empty() {
            if idle.is_some() {
                return Ok(());
            }
            continue;
        }
        let mut out = stdout.lock();
        writeln!(out, "RX: {}", hex::encode_upper(&chunk))?;
        out.flush()?;
    }
}
