//! End-to-end self-test: echo, buffer and performance groups.

use anyhow::{Context, Result, bail, ensure};
use colored::Colorize;
use hvrpc::{Buffer, BufferOp, Client, PerfReq, pattern_checksum};

use crate::human_size;

/// Buffer sizes exercised one at a time.
const BUFFER_SIZES: [usize; 6] = [4 << 10, 64 << 10, 256 << 10, 1 << 20, 4 << 20, 16 << 20];

/// Messages sent through echo.
const ECHO_MESSAGES: [&str; 4] = [
    "Hello from guest!",
    "Testing API remoting",
    "Shared channel works!",
    "This is a longer message to test buffer handling capabilities",
];

/// Pattern for single-buffer tests.
const SINGLE_PATTERN: u32 = 0xDEAD_BEEF;

/// Pattern for the multi-buffer test.
const MULTI_PATTERN: u32 = 0x1234_5678;

/// Latency round trips.
const LATENCY_ITERATIONS: u32 = 1000;

/// Throughput target and buffer size.
const THROUGHPUT_TARGET: u64 = 100 << 20;
const THROUGHPUT_BUFFER: usize = 4 << 20;

/// A selectable group of tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Group {
    /// Echo messages.
    Echo,
    /// Single and multi-buffer WRITE/VERIFY/READ.
    Buffer,
    /// Latency and throughput.
    Perf,
}

/// One named test.
type Test = (&'static str, Group, fn(&mut Client) -> Result<()>);

/// Every test in run order.
const TESTS: [Test; 5] = [
    ("echo", Group::Echo, echo),
    ("buffer operations", Group::Buffer, buffers),
    ("multi-buffer", Group::Buffer, multi_buffer),
    ("latency", Group::Perf, latency),
    ("throughput", Group::Perf, throughput),
];

/// Runs the selected tests and fails if any of them did.
pub(crate) fn run(client: &mut Client, only: Option<Group>) -> Result<()> {
    println!("{}", "hvrpc self-test".bold());
    println!("host: {}", client.handle().label());

    let mut failed = 0;
    for (name, group, test) in TESTS {
        if only.is_some_and(|g| g != group) {
            continue;
        }
        println!("\n=== {name} ===");
        match test(client) {
            Ok(()) => println!("{}", "PASS".green().bold()),
            Err(e) => {
                println!("{} {e:#}", "FAIL".red().bold());
                failed += 1;
            }
        }
    }

    println!();
    if failed > 0 {
        bail!("{failed} test(s) failed");
    }
    println!("{}", "all tests passed".green());
    Ok(())
}

fn echo(client: &mut Client) -> Result<()> {
    let mut out = [0u8; 1024];
    for msg in ECHO_MESSAGES {
        println!("sending:  {msg:?}");
        let n = client
            .echo(msg.as_bytes(), &mut out)
            .with_context(|| format!("echo of {msg:?}"))?;
        let got = String::from_utf8_lossy(&out[..n]);
        println!("received: {got:?}");
        ensure!(got == msg, "echo returned {got:?}");
    }
    Ok(())
}

fn buffers(client: &mut Client) -> Result<()> {
    for size in BUFFER_SIZES {
        println!("{} buffer", human_size(size as u64));
        let mut bufs = [Buffer::allocate(size)?];
        let expected = pattern_checksum(SINGLE_PATTERN, size as u64);

        let w = client.buffer_test(&mut bufs, BufferOp::Write, SINGLE_PATTERN)?;
        println!("  write:  {} bytes, checksum {:#010x}", w.bytes_processed, w.checksum);
        ensure!(w.bytes_processed == size as u64, "write processed {} bytes", w.bytes_processed);
        ensure!(w.checksum == expected, "write checksum {:#010x}", w.checksum);

        let v = client.buffer_test(&mut bufs, BufferOp::Verify, SINGLE_PATTERN)?;
        println!("  verify: {}", if v.is_ok() { "ok" } else { "mismatch" });
        ensure!(v.is_ok(), "verification failed with status {}", v.status);

        let r = client.buffer_test(&mut bufs, BufferOp::Read, 0)?;
        println!("  read:   checksum {:#010x}", r.checksum);
        ensure!(r.checksum == expected, "read checksum {:#010x}", r.checksum);
    }
    Ok(())
}

fn multi_buffer(client: &mut Client) -> Result<()> {
    let mut bufs = BUFFER_SIZES[..4]
        .iter()
        .map(|s| Buffer::allocate(*s))
        .collect::<hvrpc::Result<Vec<_>>>()?;
    let total: u64 = BUFFER_SIZES[..4].iter().map(|s| *s as u64).sum();
    println!("{} buffers, {} total", bufs.len(), human_size(total));

    let w = client.buffer_test(&mut bufs, BufferOp::Write, MULTI_PATTERN)?;
    println!("  processed: {} bytes", w.bytes_processed);
    println!("  checksum:  {:#010x}", w.checksum);
    ensure!(w.bytes_processed == total, "write processed {} bytes", w.bytes_processed);
    ensure!(w.checksum == pattern_checksum(MULTI_PATTERN, total), "combined checksum mismatch");

    let v = client.buffer_test(&mut bufs, BufferOp::Verify, MULTI_PATTERN)?;
    ensure!(v.is_ok(), "verification failed with status {}", v.status);
    Ok(())
}

fn latency(client: &mut Client) -> Result<()> {
    let r = client.perf_test(PerfReq::latency(LATENCY_ITERATIONS), &mut [] as &mut [Buffer])?;
    println!("  iterations: {}", r.iterations_completed);
    println!("  min: {} ns", r.min_latency_ns);
    println!("  max: {} ns", r.max_latency_ns);
    println!("  avg: {} ns", r.avg_latency_ns);
    ensure!(r.is_complete(LATENCY_ITERATIONS), "only {} iterations ran", r.iterations_completed);
    Ok(())
}

fn throughput(client: &mut Client) -> Result<()> {
    let mut bufs = [Buffer::allocate(THROUGHPUT_BUFFER)?];
    let r = client.perf_test(PerfReq::throughput(THROUGHPUT_TARGET), &mut bufs)?;
    let rating = match r.throughput_mbps {
        t if t > 1000 => "excellent",
        t if t > 500 => "good",
        t if t > 100 => "fair",
        _ => "poor",
    };
    println!("  throughput: {} MB/s ({rating})", r.throughput_mbps);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_passes_against_loopback() {
        let mut client = Client::loopback();
        run(&mut client, Some(Group::Echo)).unwrap();
        run(&mut client, Some(Group::Buffer)).unwrap();
    }

    #[test]
    fn suite_reports_failures() {
        let mut client = Client::loopback();
        client.close();
        assert!(run(&mut client, Some(Group::Echo)).is_err());
    }
}
