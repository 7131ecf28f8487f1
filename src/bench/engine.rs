use std::hint;

use serde::{Deserialize, Serialize};

use super::error::BenchError;
use crate::rdma::cq::{Cq, Wc, WcStatus};
use crate::rdma::qp::Qp;
use crate::rdma::wr::{RecvWr, SendWr};
use crate::utils::interop::from_errno;

/// How completions are waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapMode {
    /// Spin on non-blocking polls.
    #[default]
    Polling,
    /// Sleep on the completion channel between polls.
    Blocking,
}

/// Posts work requests and reaps exactly the expected number of completions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionEngine {
    mode: ReapMode,
}

impl CompletionEngine {
    pub fn new(mode: ReapMode) -> Self {
        Self { mode }
    }

    #[inline]
    pub fn mode(&self) -> ReapMode {
        self.mode
    }

    /// Submit a send-queue work request.
    #[inline]
    pub fn post_send(&self, qp: &Qp, wr: &SendWr) -> Result<(), BenchError> {
        qp.post_send(wr).map_err(Into::into)
    }

    /// Submit a receive work request.
    #[inline]
    pub fn post_recv(&self, qp: &Qp, wr: &RecvWr) -> Result<(), BenchError> {
        qp.post_recv(wr).map_err(Into::into)
    }

    /// Reap exactly `expected` completions from `cq`.
    pub fn reap(&self, cq: &Cq, expected: usize) -> Result<Vec<Wc>, BenchError> {
        let mut wcs = vec![Wc::default(); expected];
        self.reap_into(cq, &mut wcs)?;
        Ok(wcs)
    }

    /// Reap exactly `wcs.len()` completions from `cq` into `wcs`.
    ///
    /// The first entry with a non-success status fails the whole call.
    pub fn reap_into(&self, cq: &Cq, wcs: &mut [Wc]) -> Result<(), BenchError> {
        let mut reaped = 0;
        match self.mode {
            ReapMode::Polling => {
                while reaped < wcs.len() {
                    let n = cq.poll_into(&mut wcs[reaped..])? as usize;
                    check(&wcs[reaped..reaped + n])?;
                    reaped += n;
                    if n == 0 {
                        hint::spin_loop();
                    }
                }
            }
            ReapMode::Blocking => {
                let channel = cq.channel().ok_or_else(|| from_errno(libc::EINVAL))?;
                loop {
                    let n = cq.poll_into(&mut wcs[reaped..])? as usize;
                    check(&wcs[reaped..reaped + n])?;
                    reaped += n;
                    if reaped == wcs.len() {
                        break;
                    }

                    // The event may come from a sibling queue on the same
                    // channel; re-arm and ack whichever raised it.
                    let fired = channel.get_cq_event()?;
                    fired.req_notify()?;
                    fired.ack_events(1);
                }
            }
        }
        Ok(())
    }
}

fn check(wcs: &[Wc]) -> Result<(), BenchError> {
    match wcs.iter().find(|wc| wc.status() != WcStatus::Success) {
        Some(wc) => Err(BenchError::Completion {
            wr_id: wc.wr_id(),
            status: wc.status(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::rdma::context::{Context, DeviceAttr};
    use crate::rdma::cq::CompChannel;
    use crate::rdma::mr::{MrRemote, Permission};
    use crate::rdma::pd::Pd;
    use crate::rdma::qp::{QpBuilder, QpCaps};
    use crate::wrap::RegisteredMem;

    struct Pair {
        a: Qp,
        b: Qp,
        a_mem: RegisteredMem,
        b_mem: RegisteredMem,
    }

    fn pair(ctx: &Context, channel: Option<&CompChannel>) -> Pair {
        let pd = Pd::new(ctx).unwrap();
        let cq = |ch: Option<&CompChannel>| match ch {
            Some(ch) => {
                let cq = Cq::with_channel(ctx, 16, ch).unwrap();
                cq.req_notify().unwrap();
                cq
            }
            None => Cq::new(ctx, 16).unwrap(),
        };
        let qp = |ch| {
            let scq = cq(ch);
            let rcq = cq(ch);
            let qp = QpBuilder::new()
                .send_cq(&scq)
                .recv_cq(&rcq)
                .caps(QpCaps::with_depth(4))
                .sq_sig_all(true)
                .build(&pd)
                .unwrap();
            qp.init();
            qp
        };
        let a = qp(channel);
        let b = qp(None);
        Qp::bind_peers(&a, &b);
        Pair {
            a,
            b,
            a_mem: RegisteredMem::heap(&pd, 64, Permission::default()).unwrap(),
            b_mem: RegisteredMem::heap(&pd, 64, Permission::default()).unwrap(),
        }
    }

    fn write_wr(p: &Pair, wr_id: u64, remote: MrRemote) -> SendWr {
        let mut wr = SendWr::new(wr_id);
        wr.set_wr_write(remote).push_sge(p.a_mem.as_slice());
        wr
    }

    #[test]
    fn polling_reaps_in_order() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let p = pair(&ctx, None);
        let engine = CompletionEngine::new(ReapMode::Polling);
        let remote = p.b_mem.as_remote().unwrap();
        engine.post_send(&p.a, &write_wr(&p, 1, remote)).unwrap();
        engine.post_send(&p.a, &write_wr(&p, 2, remote)).unwrap();

        let wcs = engine.reap(p.a.scq(), 2).unwrap();
        assert_eq!(wcs.iter().map(Wc::wr_id).collect::<Vec<_>>(), [1, 2]);
        assert!(engine.reap(p.a.scq(), 0).unwrap().is_empty());
    }

    #[test]
    fn error_status_is_a_hard_error() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let p = pair(&ctx, None);
        let engine = CompletionEngine::new(ReapMode::Polling);
        let mut remote = p.b_mem.as_remote().unwrap();
        remote.rkey ^= 0xffff;
        engine.post_send(&p.a, &write_wr(&p, 9, remote)).unwrap();

        let err = engine.reap(p.a.scq(), 1).unwrap_err();
        assert!(matches!(
            err,
            BenchError::Completion { wr_id: 9, status: WcStatus::RemAccessErr }
        ));
    }

    #[test]
    fn blocking_waits_for_late_completions() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let channel = CompChannel::new(&ctx).unwrap();
        let p = pair(&ctx, Some(&channel));
        let engine = CompletionEngine::new(ReapMode::Blocking);

        let b_mem = &p.b_mem;
        let a_mem = &p.a_mem;
        engine
            .post_recv(&p.a, RecvWr::new(7).push_sge(a_mem.as_slice()))
            .unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                p.b.send(&[b_mem.slice(0, 16).unwrap()], 8).unwrap();
            });
            let wcs = engine.reap(p.a.rcq(), 1).unwrap();
            assert_eq!(wcs[0].wr_id(), 7);
            assert_eq!(wcs[0].bytes(), 16);
        });
        assert_eq!(p.a.rcq().unacked_events(), 0);

        // Already-queued completions are drained without waiting.
        let remote = p.b_mem.as_remote().unwrap();
        engine.post_send(&p.a, &write_wr(&p, 3, remote)).unwrap();
        assert_eq!(engine.reap(p.a.scq(), 1).unwrap()[0].wr_id(), 3);
    }

    #[test]
    fn blocking_needs_a_channel() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let p = pair(&ctx, None);
        let engine = CompletionEngine::new(ReapMode::Blocking);
        assert!(matches!(engine.reap(p.a.scq(), 1), Err(BenchError::Io(_))));
    }
}
