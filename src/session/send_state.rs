use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::wire::MAX_DATAGRAM_SIZE;

#[derive(Debug)]
pub struct SentPacket {
    pub sequence: u32,
    pub data: Bytes,
}

/// The outbound half of the reliability protocol: the word buffer the application fills,
///  the monotonic count of payload datagrams emitted, and the retention list of sent
///  payloads kept until the peer's watermark proves contiguous receipt.
///
/// The buffer always starts with the sequence number the next flush will carry
///  (`send_count + 1`), so a flush is just a copy plus a re-prime.
#[derive(Debug)]
pub struct SendState {
    send_buf: BytesMut,
    send_count: u32,
    sent_packets: VecDeque<SentPacket>,
}

impl SendState {
    pub fn new() -> SendState {
        let mut state = SendState {
            send_buf: BytesMut::with_capacity(MAX_DATAGRAM_SIZE),
            send_count: 0,
            sent_packets: VecDeque::new(),
        };
        state.prime_buffer();
        state
    }

    fn prime_buffer(&mut self) {
        self.send_buf.clear();
        self.send_buf.put_u32(self.send_count + 1);
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Append one word to the outbound buffer. A word that would grow the buffer past the
    ///  datagram limit is dropped - callers are expected to respect the 512-byte budget and
    ///  flush in time.
    pub fn add_word(&mut self, word: u32) -> bool {
        if self.send_buf.len() >= MAX_DATAGRAM_SIZE {
            debug!("outbound buffer full, dropping word {:#x}", word);
            return false;
        }
        self.send_buf.put_u32(word);
        true
    }

    /// Freeze the current buffer for transmission, retain a copy for retransmission, and
    ///  re-prime the buffer with the next sequence number.
    pub fn take_packet(&mut self) -> SentPacket {
        let sequence = self.send_count + 1;
        let data = Bytes::copy_from_slice(&self.send_buf);

        self.sent_packets.push_back(SentPacket { sequence, data: data.clone() });
        self.send_count += 1;
        self.prime_buffer();

        SentPacket { sequence, data }
    }

    /// The peer has acknowledged contiguous receipt up to `watermark`; drop every retained
    ///  payload with a strictly lower sequence.
    pub fn prune_acknowledged(&mut self, watermark: u32) {
        self.sent_packets.retain(|p| p.sequence >= watermark);
    }

    /// Look up a retained payload for retransmission.
    pub fn stored(&self, sequence: u32) -> Option<&Bytes> {
        self.sent_packets
            .iter()
            .find(|p| p.sequence == sequence)
            .map(|p| &p.data)
    }

    pub fn retained_count(&self) -> usize {
        self.sent_packets.len()
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.send_buf.len()
    }
}
