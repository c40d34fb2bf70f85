//! Test client for the hvrpc guest/host call channel.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod suite;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use hvrpc::{Buffer, BufferOp, Client, Endpoint, PerfReq, PerfResp};

#[derive(Parser)]
#[command(name = "hvrpc", version, about = "Call into the hypervisor host from a guest")]
struct Cli {
    /// Host endpoint: unix:<path> or vsock:<cid>:<port> [env: HVRPC_ENDPOINT].
    #[arg(long, global = true, conflicts_with = "loopback")]
    endpoint: Option<Endpoint>,

    /// Use the in-process reference host instead of a real one.
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Echo a message through the host.
    Echo {
        /// Message to send.
        message: String,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Have the host read, fill or verify shared buffers.
    Buffer(BufferArgs),

    /// Measure latency or throughput.
    Perf {
        #[command(subcommand)]
        kind: PerfCommand,
    },

    /// Run the full self-test against the host.
    Suite {
        /// Run only one group of tests.
        #[arg(long)]
        only: Option<suite::Group>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Arguments for `hvrpc buffer`.
#[derive(clap::Args)]
struct BufferArgs {
    /// Operation to perform.
    #[arg(value_enum)]
    op: OpArg,

    /// Size of each buffer (e.g. 4K, 1M, 16MiB).
    #[arg(long, default_value = "4K", value_parser = parse_size)]
    size: usize,

    /// Number of buffers (1-8).
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Fill pattern; only the low byte is used (decimal or 0x-hex).
    #[arg(long, default_value = "0xDEADBEEF", value_parser = parse_pattern)]
    pattern: u32,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

/// Buffer operations accepted on the command line.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OpArg {
    /// Read and checksum.
    Read,
    /// Fill with the pattern.
    Write,
    /// Fill with the pattern, then verify it.
    Verify,
}

/// Subcommands for `hvrpc perf`.
#[derive(Subcommand)]
enum PerfCommand {
    /// Round-trip latency.
    Latency {
        /// Number of round trips.
        #[arg(long, default_value_t = 1000)]
        iterations: u32,

        /// Time from the guest instead of asking the host.
        #[arg(long)]
        client: bool,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Bulk transfer throughput.
    Throughput {
        /// Total bytes to move (e.g. 100M).
        #[arg(long, default_value = "100M", value_parser = parse_size)]
        target: usize,

        /// Size of the shared buffer (e.g. 4M).
        #[arg(long, default_value = "4M", value_parser = parse_size)]
        buffer_size: usize,

        /// Time from the guest instead of asking the host.
        #[arg(long)]
        client: bool,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Output format for results.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("hvrpc: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "hvrpc", &mut std::io::stdout());
            return Ok(());
        }
        let mut client = self.connect()?;
        match self.command {
            Command::Echo { message, format } => echo(&mut client, &message, format),
            Command::Buffer(args) => buffer(&mut client, &args),
            Command::Perf { kind } => perf(&mut client, kind),
            Command::Suite { only } => suite::run(&mut client, only),
            Command::Completion { .. } => Ok(()),
        }
    }

    /// Opens the requested host, or the built-in one with `--loopback`.
    fn connect(&self) -> Result<Client> {
        if self.loopback {
            return Ok(Client::loopback());
        }
        let endpoint = match &self.endpoint {
            Some(e) => e.clone(),
            None => Endpoint::from_env()?,
        };
        Client::open(&endpoint).with_context(|| format!("cannot reach host at {endpoint}"))
    }
}

fn echo(client: &mut Client, message: &str, format: OutputFormat) -> Result<()> {
    let reply = client.echo_bytes(message.as_bytes())?;
    let reply = String::from_utf8_lossy(&reply);

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({ "sent": message, "received": reply });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }
    println!("{reply}");
    Ok(())
}

fn buffer(client: &mut Client, args: &BufferArgs) -> Result<()> {
    let mut bufs = (0..args.count)
        .map(|_| Buffer::allocate(args.size))
        .collect::<hvrpc::Result<Vec<_>>>()
        .with_context(|| format!("allocating {} x {}", args.count, human_size(args.size as u64)))?;

    let resp = match args.op {
        OpArg::Read => client.buffer_test(&mut bufs, BufferOp::Read, args.pattern)?,
        OpArg::Write => client.buffer_test(&mut bufs, BufferOp::Write, args.pattern)?,
        OpArg::Verify => {
            client.buffer_test(&mut bufs, BufferOp::Write, args.pattern)?;
            client.buffer_test(&mut bufs, BufferOp::Verify, args.pattern)?
        }
    };

    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else {
        println!("processed: {}", human_size(resp.bytes_processed));
        println!("checksum:  {:#010x}", resp.checksum);
        println!("status:    {}", if resp.is_ok() { "ok" } else { "mismatch" });
    }
    if !resp.is_ok() {
        bail!("host reported status {}", resp.status);
    }
    Ok(())
}

fn perf(client: &mut Client, kind: PerfCommand) -> Result<()> {
    match kind {
        PerfCommand::Latency {
            iterations,
            client: guest_side,
            format,
        } => {
            let req = PerfReq::latency(iterations);
            let resp = if guest_side {
                hvrpc::bench::measure(client, &req, &mut [] as &mut [Buffer])?
            } else {
                client.perf_test(req, &mut [] as &mut [Buffer])?
            };
            report_perf(&resp, iterations, format)
        }
        PerfCommand::Throughput {
            target,
            buffer_size,
            client: guest_side,
            format,
        } => {
            let mut bufs = [Buffer::allocate(buffer_size)
                .with_context(|| format!("allocating {}", human_size(buffer_size as u64)))?];
            let req = PerfReq::throughput(target as u64);
            let resp = if guest_side {
                hvrpc::bench::measure(client, &req, &mut bufs)?
            } else {
                client.perf_test(req, &mut bufs)?
            };
            report_perf(&resp, 0, format)
        }
    }
}

fn report_perf(resp: &PerfResp, requested: u32, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(resp)?);
        return Ok(());
    }
    println!("iterations: {}", resp.iterations_completed);
    if resp.throughput_mbps > 0 {
        println!("throughput: {} MB/s", resp.throughput_mbps);
    }
    println!("min:        {}", nanos(resp.min_latency_ns));
    println!("max:        {}", nanos(resp.max_latency_ns));
    println!("avg:        {}", nanos(resp.avg_latency_ns));
    if !resp.is_complete(requested) {
        eprintln!(
            "hvrpc: run cut short after {} of {requested} iterations",
            resp.iterations_completed
        );
    }
    Ok(())
}

/// Parses a byte count with an optional K/M/G suffix (powers of 1024).
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let n: usize = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    let shift = match suffix.to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        _ => return Err(format!("unknown size suffix {suffix:?}")),
    };
    n.checked_mul(1 << shift)
        .ok_or_else(|| format!("size {s:?} is too large"))
}

/// Parses a decimal or `0x`-prefixed hexadecimal `u32`.
fn parse_pattern(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid pattern {s:?}"))
}

/// Formats nanoseconds with a microsecond reading alongside.
#[allow(clippy::cast_precision_loss)]
fn nanos(ns: u64) -> String {
    format!("{ns} ns ({:.2} µs)", ns as f64 / 1000.0)
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("64kib"), Ok(64 * 1024));
        assert_eq!(parse_size("16M"), Ok(16 << 20));
        assert!(parse_size("4X").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn patterns_in_hex_or_decimal() {
        assert_eq!(parse_pattern("0xDEADBEEF"), Ok(0xDEAD_BEEF));
        assert_eq!(parse_pattern("171"), Ok(0xAB));
        assert!(parse_pattern("0xZZ").is_err());
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(4096), "4.0 KB");
        assert_eq!(human_size(16 << 20), "16.0 MB");
    }

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "hvrpc",
            "--endpoint",
            "vsock:2:1024",
            "buffer",
            "verify",
            "--size",
            "1M",
        ])
        .unwrap();
        assert_eq!(cli.endpoint, Some(Endpoint::Vsock { cid: 2, port: 1024 }));
        let both = ["hvrpc", "--loopback", "--endpoint", "unix:/x", "suite"];
        assert!(Cli::try_parse_from(both).is_err());
    }

    #[test]
    fn loopback_commands_succeed() {
        let mut client = Client::loopback();
        let args = BufferArgs {
            op: OpArg::Verify,
            size: 8192,
            count: 2,
            pattern: 0xAB,
            format: OutputFormat::Json,
        };
        buffer(&mut client, &args).unwrap();
        perf(
            &mut client,
            PerfCommand::Latency {
                iterations: 10,
                client: true,
                format: OutputFormat::Table,
            },
        )
        .unwrap();
    }
}
