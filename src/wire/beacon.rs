use bytes::{Buf, BufMut};

use crate::wire::message_id::MessageId;
use crate::wire::MAX_DATAGRAM_SIZE;

/// The periodic reliability beacon exchanged between the two session engines (and echoed
///  through the relay when no direct link exists):
///
/// ```ascii
/// 0:  0x0000FFFF (check): u32
/// 4:  sender clock, milliseconds since session start: u32
/// 8:  newest application state hash: u32
/// 12: min_pack_rcvd - the sequence up to which the sender has received contiguously: u32
/// 16: send_count - total payload datagrams the sender has emitted: u32
/// 20: (repeated) missing sequence number, the sender's NAK list: u32
/// ```
///
/// The receiver answers the clock with a `ping` echo, compares the hash against its own
///  recent history, prunes its retransmission list below the watermark, fast-forwards its
///  receive view to `send_count`, and re-sends every NAK'ed payload it still retains.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckPacket {
    pub clock_ms: u32,
    pub state_hash: u32,
    pub min_pack_rcvd: u32,
    pub send_count: u32,
    pub missing: Vec<u32>,
}

impl CheckPacket {
    /// id + the four fixed fields
    const HEADER_WORDS: usize = 5;

    /// NAK entries beyond this do not fit into a datagram and are deferred to a later
    ///  beacon - by then the earlier ones have usually been re-delivered anyway.
    pub const MAX_MISSING_IDS: usize = MAX_DATAGRAM_SIZE / 4 - Self::HEADER_WORDS;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(MessageId::Check.into());
        buf.put_u32(self.clock_ms);
        buf.put_u32(self.state_hash);
        buf.put_u32(self.min_pack_rcvd);
        buf.put_u32(self.send_count);
        for &id in self.missing.iter().take(Self::MAX_MISSING_IDS) {
            buf.put_u32(id);
        }
    }

    /// Expects the leading `check` word to be consumed already. Trailing bytes that do not
    ///  form a whole word are ignored.
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CheckPacket> {
        let clock_ms = buf.try_get_u32()?;
        let state_hash = buf.try_get_u32()?;
        let min_pack_rcvd = buf.try_get_u32()?;
        let send_count = buf.try_get_u32()?;

        let mut missing = Vec::new();
        while buf.remaining() >= 4 {
            missing.push(buf.get_u32());
        }

        Ok(CheckPacket {
            clock_ms,
            state_hash,
            min_pack_rcvd,
            send_count,
            missing,
        })
    }
}
