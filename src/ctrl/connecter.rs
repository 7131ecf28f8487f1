use thiserror::Error;

use crate::rdma::cq::{Wc, WcOpcode};
use crate::rdma::mr::MrRemote;
use crate::rdma::qp::{PostError, Qp};
use crate::rdma::type_alias::WrId;
use crate::wrap::RegisteredMem;

/// Size of a descriptor on the wire: `u64` address, `u32` length, `u32` rkey,
/// little-endian, packed.
pub const DESCRIPTOR_LEN: usize = 16;

/// Work request ID of the descriptor send and receive.
pub const DESCRIPTOR_WR_ID: WrId = 0xd35c;

/// Descriptor exchange error type.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The received message is not exactly one descriptor.
    #[error("truncated descriptor: {got} bytes received, {expected} expected")]
    Truncated { expected: usize, got: usize },

    /// The advertised region length differs from the configured message size.
    #[error("descriptor length mismatch: peer advertised {got} bytes, {expected} expected")]
    LengthMismatch { expected: usize, got: usize },

    /// The completion does not belong to the descriptor receive.
    #[error("unexpected completion: WR {wr_id} ({opcode:?})")]
    Unexpected { wr_id: WrId, opcode: WcOpcode },

    /// The region to advertise grants no remote access.
    #[error("region has no remote key")]
    NoRemoteKey,

    /// The metadata buffer cannot hold a descriptor.
    #[error("metadata buffer of {0} bytes is too small")]
    BufferTooSmall(usize),

    /// Posting the send or receive failed.
    #[error("cannot post descriptor work request")]
    Post(#[from] PostError),
}

/// Encode a descriptor into its wire form.
pub fn encode(remote: &MrRemote) -> [u8; DESCRIPTOR_LEN] {
    let mut buf = [0u8; DESCRIPTOR_LEN];
    buf[0..8].copy_from_slice(&remote.addr.to_le_bytes());
    buf[8..12].copy_from_slice(&(remote.len as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&remote.rkey.to_le_bytes());
    buf
}

/// Decode a descriptor from its wire form.
pub fn decode(buf: &[u8]) -> Result<MrRemote, ExchangeError> {
    let buf: &[u8; DESCRIPTOR_LEN] = buf
        .get(..DESCRIPTOR_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ExchangeError::Truncated {
            expected: DESCRIPTOR_LEN,
            got: buf.len(),
        })?;
    let mut addr = [0u8; 8];
    let mut len = [0u8; 4];
    let mut rkey = [0u8; 4];
    addr.copy_from_slice(&buf[0..8]);
    len.copy_from_slice(&buf[8..12]);
    rkey.copy_from_slice(&buf[12..16]);
    Ok(MrRemote::new(
        u64::from_le_bytes(addr),
        u32::from_le_bytes(len) as usize,
        u32::from_le_bytes(rkey),
    ))
}

/// One-shot remote-memory descriptor exchange over a connected queue pair.
///
/// The receiving side posts its receive *before* connecting; the publishing
/// side sends exactly once after establishment. No acknowledgement is sent
/// back. Completions are reaped by the caller.
pub struct Connecter<'a> {
    qp: &'a Qp,
    meta: &'a RegisteredMem,
}

impl<'a> Connecter<'a> {
    /// Create a new exchange over `qp`, staging descriptors in `meta`.
    pub fn new(qp: &'a Qp, meta: &'a RegisteredMem) -> Result<Self, ExchangeError> {
        if meta.len() < DESCRIPTOR_LEN {
            return Err(ExchangeError::BufferTooSmall(meta.len()));
        }
        Ok(Self { qp, meta })
    }

    /// Post the receive for the peer's descriptor.
    pub fn post_descriptor_recv(&self) -> Result<(), ExchangeError> {
        let slice = self
            .meta
            .slice(0, DESCRIPTOR_LEN)
            .ok_or(ExchangeError::BufferTooSmall(self.meta.len()))?;
        self.qp.recv(&[slice], DESCRIPTOR_WR_ID)?;
        Ok(())
    }

    /// Encode the descriptor of `region` into the metadata buffer and post a
    /// signaled send of it. Return the published descriptor.
    pub fn publish_descriptor(&self, region: &RegisteredMem) -> Result<MrRemote, ExchangeError> {
        let remote = region.as_remote().ok_or(ExchangeError::NoRemoteKey)?;
        self.meta.write_at(0, &encode(&remote));
        let slice = self
            .meta
            .slice(0, DESCRIPTOR_LEN)
            .ok_or(ExchangeError::BufferTooSmall(self.meta.len()))?;
        self.qp.send(&[slice], DESCRIPTOR_WR_ID)?;
        log::debug!(
            "rwbench: QP {:#x} published {:#x}+{} rkey={:#x}",
            self.qp.qp_num(),
            remote.addr,
            remote.len,
            remote.rkey
        );
        Ok(remote)
    }

    /// Validate the receive completion of the descriptor and decode it.
    /// The advertised length must equal `message_size`.
    pub fn recv(&self, wc: &Wc, message_size: usize) -> Result<MrRemote, ExchangeError> {
        if wc.wr_id() != DESCRIPTOR_WR_ID || wc.opcode() != WcOpcode::Recv {
            return Err(ExchangeError::Unexpected {
                wr_id: wc.wr_id(),
                opcode: wc.opcode(),
            });
        }
        if wc.bytes() != DESCRIPTOR_LEN {
            return Err(ExchangeError::Truncated {
                expected: DESCRIPTOR_LEN,
                got: wc.bytes(),
            });
        }
        let remote = decode(&self.meta.snapshot())?;
        if remote.len != message_size {
            return Err(ExchangeError::LengthMismatch {
                expected: message_size,
                got: remote.len,
            });
        }
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        let remote = MrRemote::new(0x1122_3344_5566_7788, 100, 0xaabb_ccdd);
        let buf = encode(&remote);
        assert_eq!(&buf[0..8], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[8..12], &[100, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(decode(&buf).unwrap(), remote);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            decode(&[0u8; 12]),
            Err(ExchangeError::Truncated { expected: 16, got: 12 })
        ));
    }
}
