use std::thread;
use std::time::Duration;

use quanta::Instant;

use super::conn::Connection;
use super::context::BenchContext;
use super::engine::CompletionEngine;
use super::error::BenchError;
use super::stats::WorkerStats;
use crate::rdma::cm::CmError;
use crate::rdma::cq::Wc;
use crate::rdma::mr::{MrRemote, MrSlice};
use crate::rdma::qp::Qp;
use crate::rdma::wr::SendWr;

const WRITE_WR_ID: u64 = 0x5752;
const READ_WR_ID: u64 = 0x5244;

/// Everything a worker needs from its connection, borrowed for the run.
pub struct WorkerJob<'a> {
    index: usize,
    qp: &'a Qp,
    src: MrSlice<'a>,
    dst: MrSlice<'a>,
    remote: MrRemote,
    engine: CompletionEngine,
}

impl<'a> WorkerJob<'a> {
    /// Borrow the queue pair, buffers and peer descriptor of an established,
    /// exchanged initiator connection.
    pub fn new(conn: &'a Connection, engine: CompletionEngine) -> Result<Self, BenchError> {
        let (Some(qp), Some(src), Some(dst), Some(remote)) =
            (conn.qp(), conn.data(), conn.sink(), conn.remote())
        else {
            return Err(CmError::InvalidState("connection not ready for benchmarking").into());
        };
        Ok(Self {
            index: conn.index(),
            qp,
            src: src.as_slice(),
            dst: dst.as_slice(),
            remote,
            engine,
        })
    }

    /// Index of the connection this job drives.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Aim the job at `remote`, e.g. a sub-range of the peer's region.
    pub fn retarget(&mut self, remote: MrRemote) {
        self.remote = remote;
    }

    /// Run one write+read round trip.
    fn round_trip(&self, write: &SendWr, read: &SendWr, wc: &mut [Wc; 1]) -> Result<(), BenchError> {
        self.engine.post_send(self.qp, write)?;
        self.engine.reap_into(self.qp.scq(), wc)?;
        self.engine.post_send(self.qp, read)?;
        self.engine.reap_into(self.qp.scq(), wc)?;
        Ok(())
    }

    /// Wait for the start gate, then loop round trips until the stop gate.
    /// The first error ends the loop and is kept in the returned statistics.
    pub fn run(self, ctx: &BenchContext) -> WorkerStats {
        let mut stats = WorkerStats::new(self.index);
        let mut write = SendWr::new(WRITE_WR_ID);
        write.set_wr_write(self.remote).push_sge(self.src);
        let mut read = SendWr::new(READ_WR_ID);
        read.set_wr_read(self.remote).push_sge(self.dst);
        // One message per round trip, as the write and the read move the
        // same payload.
        let bytes = self.src.len() as u64;
        let mut wc = [Wc::default(); 1];

        let gate = ctx.gate();
        if !gate.wait_open() {
            return stats;
        }
        let start = Instant::now();
        while !gate.should_stop() {
            let t0 = Instant::now();
            if let Err(e) = self.round_trip(&write, &read, &mut wc) {
                log::error!("rwbench: worker {} stopped: {}", self.index, e);
                stats.error = Some(e);
                break;
            }
            stats.record(t0.elapsed(), bytes);
        }
        stats.elapsed = start.elapsed();
        log::debug!(
            "rwbench: worker {} done, {} ops in {:?}",
            self.index,
            stats.ops,
            stats.elapsed
        );
        stats
    }
}

/// Run one scoped thread per job. The start gate opens after `prepare`, the
/// stop gate is raised `duration` later, and the statistics of every worker
/// that did not panic are returned in job order.
pub fn run_workers(
    jobs: Vec<WorkerJob<'_>>,
    ctx: &BenchContext,
    prepare: Duration,
    duration: Duration,
) -> Vec<WorkerStats> {
    thread::scope(|s| {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| (job.index, s.spawn(move || job.run(ctx))))
            .collect();

        thread::sleep(prepare);
        log::info!("rwbench: starting {} worker(s)", handles.len());
        ctx.gate().open();
        thread::sleep(duration);
        ctx.gate().stop();

        handles
            .into_iter()
            .filter_map(|(index, handle)| match handle.join() {
                Ok(stats) => Some(stats),
                Err(_) => {
                    log::error!("rwbench: worker {} panicked", index);
                    None
                }
            })
            .collect()
    })
}
