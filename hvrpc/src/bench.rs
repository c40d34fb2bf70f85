//! Guest-driven performance measurement.
//!
//! [`measure`] times round trips from the guest side instead of asking the
//! host to time itself. A transport failure after at least one successful
//! iteration ends the run early with a partial result;
//! [`PerfResp::iterations_completed`] tells the caller how far it got.

use std::time::{Duration, Instant};

use hvrpc_proto::{BufferOp, PerfKind, PerfReq, PerfResp};

use crate::client::Client;
use crate::error::{ErrorKind, Invalid, Result};

/// Running min/max/mean over per-iteration timings.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Stats {
    /// Fastest sample.
    min: u64,
    /// Slowest sample.
    max: u64,
    /// Sum of all samples.
    sum: u64,
    /// Number of samples.
    count: u32,
}

impl Stats {
    /// Adds one sample.
    pub(crate) fn record(&mut self, ns: u64) {
        self.min = if self.count == 0 { ns } else { self.min.min(ns) };
        self.max = self.max.max(ns);
        self.sum = self.sum.saturating_add(ns);
        self.count = self.count.saturating_add(1);
    }

    /// Number of samples recorded.
    pub(crate) const fn count(&self) -> u32 {
        self.count
    }

    /// Builds the result; all zeros when nothing was recorded.
    pub(crate) fn finish(self, throughput_mbps: u64) -> PerfResp {
        let avg = self.sum.checked_div(u64::from(self.count)).unwrap_or(0);
        PerfResp::new(self.min, self.max, avg, throughput_mbps, self.count)
    }
}

/// Saturating nanosecond count of `d`.
pub(crate) fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// MB/s for `bytes` moved in `elapsed`.
pub(crate) fn mbps(bytes: u64, elapsed: Duration) -> u64 {
    // bytes/ns * 1000 == MB/s
    bytes.saturating_mul(1000) / nanos(elapsed).max(1)
}

/// Runs `req` from the guest side.
///
/// LATENCY issues `req.iterations` empty echo calls. THROUGHPUT repeats a
/// READ buffer exercise over `buffers` until `req.target_bytes` have been
/// processed, and needs at least one buffer.
pub fn measure<B: AsMut<[u8]>>(
    client: &mut Client,
    req: &PerfReq,
    buffers: &mut [B],
) -> Result<PerfResp> {
    match req.kind {
        PerfKind::Latency => latency(client, req.iterations),
        PerfKind::Throughput => throughput(client, req.target_bytes, buffers),
        _ => Err(Invalid::Params("unsupported perf kind").into()),
    }
}

/// Times `iterations` empty echo round trips.
fn latency(client: &mut Client, iterations: u32) -> Result<PerfResp> {
    let mut stats = Stats::default();
    for _ in 0..iterations {
        let start = Instant::now();
        match client.echo_bytes(b"") {
            Ok(_) => stats.record(nanos(start.elapsed())),
            Err(e) if e.kind() == ErrorKind::Transport && stats.count() > 0 => {
                tracing::warn!(
                    completed = stats.count(),
                    iterations,
                    error = %e,
                    "latency run cut short"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats.finish(0))
}

/// Moves at least `target` bytes through READ buffer exercises.
fn throughput<B: AsMut<[u8]>>(
    client: &mut Client,
    target: u64,
    buffers: &mut [B],
) -> Result<PerfResp> {
    if buffers.is_empty() {
        return Err(Invalid::Params("throughput needs at least one buffer").into());
    }
    let mut stats = Stats::default();
    let mut total = 0u64;
    let start = Instant::now();
    while total < target {
        let pass = Instant::now();
        match client.buffer_test(buffers, BufferOp::Read, 0) {
            Ok(resp) if resp.bytes_processed == 0 => break,
            Ok(resp) => {
                total = total.saturating_add(resp.bytes_processed);
                stats.record(nanos(pass.elapsed()));
            }
            Err(e) if e.kind() == ErrorKind::Transport && stats.count() > 0 => {
                tracing::warn!(total, target, error = %e, "throughput run cut short");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats.finish(mbps(total, start.elapsed())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;
    use crate::transport::Handle;

    fn client_failing_after(n: u64) -> Client {
        Client::new(Handle::from_transport(
            Loopback::new().with_failure_after(n),
            "loopback",
        ))
    }

    #[test]
    fn stats_order() {
        let mut s = Stats::default();
        for ns in [30, 10, 20] {
            s.record(ns);
        }
        let r = s.finish(0);
        assert_eq!((r.min_latency_ns, r.max_latency_ns, r.avg_latency_ns), (10, 30, 20));
        assert_eq!(r.iterations_completed, 3);
    }

    #[test]
    fn empty_stats_are_zero() {
        assert_eq!(Stats::default().finish(0), PerfResp::default());
    }

    #[test]
    fn latency_counts_iterations() {
        let mut client = Client::loopback();
        let resp = measure(&mut client, &PerfReq::latency(50), &mut [] as &mut [Vec<u8>]).unwrap();
        assert_eq!(resp.iterations_completed, 50);
        assert!(resp.min_latency_ns <= resp.avg_latency_ns);
        assert!(resp.avg_latency_ns <= resp.max_latency_ns);
    }

    #[test]
    fn latency_failure_mid_run_is_partial() {
        let mut client = client_failing_after(5);
        let resp = measure(&mut client, &PerfReq::latency(100), &mut [] as &mut [Vec<u8>]).unwrap();
        assert_eq!(resp.iterations_completed, 5);
        assert!(!resp.is_complete(100));
    }

    #[test]
    fn failure_on_first_iteration_is_an_error() {
        let mut client = client_failing_after(0);
        let err = measure(&mut client, &PerfReq::latency(10), &mut [] as &mut [Vec<u8>])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn throughput_reaches_target() {
        let mut client = Client::loopback();
        let mut bufs = [vec![0u8; 4096], vec![0u8; 4096]];
        let resp = measure(&mut client, &PerfReq::throughput(64 * 1024), &mut bufs).unwrap();
        // 8 KiB per pass.
        assert_eq!(resp.iterations_completed, 8);
    }

    #[test]
    fn throughput_needs_a_buffer() {
        let mut client = Client::loopback();
        let err = measure(&mut client, &PerfReq::throughput(1), &mut [] as &mut [Vec<u8>])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
