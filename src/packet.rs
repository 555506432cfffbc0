use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Sequence number of a data packet in one direction of a session. Starts at 0 and never
///  wraps in practice (64-bit space). `-1` means "none yet" in window bookkeeping.
pub type Seqno = i64;

/// Sentinel sequence number for packets that carry no data (acks, keep-alives).
pub const NO_DATA_SEQNO: Seqno = -99;

/// The unit exchanged between the two endpoints of a session.
///
/// Timestamps are nanoseconds since the Unix epoch as read from the session's
///  [`crate::clock::Clock`]; 0 means "not stamped".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub from: String,
    pub dest: String,

    /// stamped by the receiving endpoint when the packet arrives
    pub arrived_at_dest_tm: i64,
    /// stamped by the sender when the packet is first transmitted
    pub data_send_tm: i64,

    pub seq_num: Seqno,
    /// number of retransmissions this packet has undergone
    pub seq_retry: i64,

    /// cumulative ack: acknowledges every sequence number `<= ack_num`
    pub ack_num: Seqno,
    /// number of acks this endpoint has emitted so far - acks are regenerated, never retried
    pub ack_retry: i64,
    /// stamped by the receiver when it generates an ack
    pub ack_reply_tm: i64,

    /// true iff this packet carries no payload and exists solely to convey an ack and
    ///  flow-control update
    pub ack_only: bool,
    /// true iff this is a probe generated to solicit flow-control feedback while idle
    pub keep_alive: bool,

    /// advertised window: the originating receiver's currently free capacity in bytes.
    ///
    /// NB: both a byte and a message budget are conveyed because some substrates limit both
    pub avail_reader_bytes_cap: i64,
    /// advertised window: the originating receiver's currently free capacity in messages
    pub avail_reader_msg_cap: i64,

    /// the sender's current smoothed RTT estimate, shared for observability
    pub from_rtt_est_nsec: i64,
    pub from_rtt_sd_nsec: i64,
    pub from_rtt_n: i64,

    /// running total of payload bytes the sender has ever enqueued up to and including this
    ///  packet. Monotonically non-decreasing in `seq_num` order.
    pub cumul_bytes_transmitted: i64,

    pub data: Bytes,
}

impl Default for Packet {
    fn default() -> Packet {
        Packet {
            from: String::new(),
            dest: String::new(),
            arrived_at_dest_tm: 0,
            data_send_tm: 0,
            seq_num: NO_DATA_SEQNO,
            seq_retry: 0,
            ack_num: -1,
            ack_retry: 0,
            ack_reply_tm: 0,
            ack_only: false,
            keep_alive: false,
            avail_reader_bytes_cap: 0,
            avail_reader_msg_cap: 0,
            from_rtt_est_nsec: 0,
            from_rtt_sd_nsec: 0,
            from_rtt_n: 0,
            cumul_bytes_transmitted: 0,
            data: Bytes::new(),
        }
    }
}

mod tags {
    pub const FROM: u8 = 1;
    pub const DEST: u8 = 2;
    pub const ARRIVED_AT_DEST_TM: u8 = 3;
    pub const DATA_SEND_TM: u8 = 4;
    pub const SEQ_NUM: u8 = 5;
    pub const SEQ_RETRY: u8 = 6;
    pub const ACK_NUM: u8 = 7;
    pub const ACK_RETRY: u8 = 8;
    pub const ACK_REPLY_TM: u8 = 9;
    pub const ACK_ONLY: u8 = 10;
    pub const KEEP_ALIVE: u8 = 11;
    pub const AVAIL_READER_BYTES_CAP: u8 = 12;
    pub const AVAIL_READER_MSG_CAP: u8 = 13;
    pub const FROM_RTT_EST_NSEC: u8 = 14;
    pub const FROM_RTT_SD_NSEC: u8 = 15;
    pub const FROM_RTT_N: u8 = 16;
    pub const CUMUL_BYTES_TRANSMITTED: u8 = 17;
    pub const DATA: u8 = 18;
}

fn put_field_i64(buf: &mut BytesMut, tag: u8, value: i64) {
    let mut scratch = BytesMut::with_capacity(10);
    scratch.put_i64_varint(value);
    buf.put_u8(tag);
    buf.put_usize_varint(scratch.len());
    buf.put_slice(&scratch);
}

fn put_field_bool(buf: &mut BytesMut, tag: u8, value: bool) {
    buf.put_u8(tag);
    buf.put_usize_varint(1);
    buf.put_u8(value as u8);
}

fn put_field_bytes(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_usize_varint(value.len());
    buf.put_slice(value);
}

fn get_i64(value: &[u8]) -> anyhow::Result<i64> {
    let mut buf = value;
    let result = buf.try_get_i64_varint()
        .map_err(|e| anyhow!("malformed varint field: {:?}", e))?;
    if !buf.is_empty() {
        bail!("trailing garbage in integer field");
    }
    Ok(result)
}

fn get_bool(value: &[u8]) -> anyhow::Result<bool> {
    match value {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => bail!("malformed bool field"),
    }
}

impl Packet {
    /// convenience constructor for the producer side: everything except addressing and
    ///  payload is filled in by the sender on enqueue
    pub fn data(from: impl Into<String>, dest: impl Into<String>, data: impl Into<Bytes>) -> Packet {
        Packet {
            from: from.into(),
            dest: dest.into(),
            data: data.into(),
            ..Packet::default()
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_field_bytes(buf, tags::FROM, self.from.as_bytes());
        put_field_bytes(buf, tags::DEST, self.dest.as_bytes());
        put_field_i64(buf, tags::ARRIVED_AT_DEST_TM, self.arrived_at_dest_tm);
        put_field_i64(buf, tags::DATA_SEND_TM, self.data_send_tm);
        put_field_i64(buf, tags::SEQ_NUM, self.seq_num);
        put_field_i64(buf, tags::SEQ_RETRY, self.seq_retry);
        put_field_i64(buf, tags::ACK_NUM, self.ack_num);
        put_field_i64(buf, tags::ACK_RETRY, self.ack_retry);
        put_field_i64(buf, tags::ACK_REPLY_TM, self.ack_reply_tm);
        put_field_bool(buf, tags::ACK_ONLY, self.ack_only);
        put_field_bool(buf, tags::KEEP_ALIVE, self.keep_alive);
        put_field_i64(buf, tags::AVAIL_READER_BYTES_CAP, self.avail_reader_bytes_cap);
        put_field_i64(buf, tags::AVAIL_READER_MSG_CAP, self.avail_reader_msg_cap);
        put_field_i64(buf, tags::FROM_RTT_EST_NSEC, self.from_rtt_est_nsec);
        put_field_i64(buf, tags::FROM_RTT_SD_NSEC, self.from_rtt_sd_nsec);
        put_field_i64(buf, tags::FROM_RTT_N, self.from_rtt_n);
        put_field_i64(buf, tags::CUMUL_BYTES_TRANSMITTED, self.cumul_bytes_transmitted);
        put_field_bytes(buf, tags::DATA, &self.data);
    }

    /// Parses a packet from a buffer. Fields may appear in any order; unknown tags are
    ///  skipped so peers can add fields without breaking older readers.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let mut packet = Packet::default();

        while buf.has_remaining() {
            let tag = buf.get_u8();
            let len = buf.try_get_usize_varint()
                .map_err(|e| anyhow!("malformed field length: {:?}", e))?;
            if len > buf.remaining() {
                bail!("field length {} exceeds remaining buffer {}", len, buf.remaining());
            }
            let value = buf.copy_to_bytes(len);

            match tag {
                tags::FROM => packet.from = String::from_utf8(value.to_vec())?,
                tags::DEST => packet.dest = String::from_utf8(value.to_vec())?,
                tags::ARRIVED_AT_DEST_TM => packet.arrived_at_dest_tm = get_i64(&value)?,
                tags::DATA_SEND_TM => packet.data_send_tm = get_i64(&value)?,
                tags::SEQ_NUM => packet.seq_num = get_i64(&value)?,
                tags::SEQ_RETRY => packet.seq_retry = get_i64(&value)?,
                tags::ACK_NUM => packet.ack_num = get_i64(&value)?,
                tags::ACK_RETRY => packet.ack_retry = get_i64(&value)?,
                tags::ACK_REPLY_TM => packet.ack_reply_tm = get_i64(&value)?,
                tags::ACK_ONLY => packet.ack_only = get_bool(&value)?,
                tags::KEEP_ALIVE => packet.keep_alive = get_bool(&value)?,
                tags::AVAIL_READER_BYTES_CAP => packet.avail_reader_bytes_cap = get_i64(&value)?,
                tags::AVAIL_READER_MSG_CAP => packet.avail_reader_msg_cap = get_i64(&value)?,
                tags::FROM_RTT_EST_NSEC => packet.from_rtt_est_nsec = get_i64(&value)?,
                tags::FROM_RTT_SD_NSEC => packet.from_rtt_sd_nsec = get_i64(&value)?,
                tags::FROM_RTT_N => packet.from_rtt_n = get_i64(&value)?,
                tags::CUMUL_BYTES_TRANSMITTED => packet.cumul_bytes_transmitted = get_i64(&value)?,
                tags::DATA => packet.data = value,
                _ => {
                    // unknown field from a newer peer - skip
                }
            }
        }

        Ok(packet)
    }
}

/// returns true iff `seqno` is in `[min, max]`
pub fn in_window(seqno: Seqno, min: Seqno, max: Seqno) -> bool {
    seqno >= min && seqno <= max
}
