//! Receive path from RTP datagrams to ordered access units and NACKs

use bytes::Bytes;
use castsink_protocol::{
    GenericNack, LossEvent, ReorderBuffer, ReorderConfig, RtpPacket, SeqExtender,
};
use castsink_render::AccessUnit;
use parking_lot::Mutex;
use std::sync::Arc;

const SSRC: u32 = 0x1234_5678;
const FEEDBACK_SSRC: u32 = 0xDEAD_BEEF;

fn datagram(seq: u16, rtp_time: u32) -> Bytes {
    RtpPacket::new(33, seq, rtp_time, SSRC, Bytes::from(seq.to_be_bytes().to_vec()))
        .to_bytes()
        .freeze()
}

struct Receiver {
    extender: SeqExtender,
    buffer: ReorderBuffer,
    events: Arc<Mutex<Vec<LossEvent>>>,
}

impl Receiver {
    fn new() -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        Receiver {
            extender: SeqExtender::new(),
            buffer: ReorderBuffer::with_notifier(ReorderConfig::default(), move |e| {
                sink.lock().push(e)
            }),
            events,
        }
    }

    fn receive(&mut self, datagram: Bytes) {
        let packet = RtpPacket::parse(datagram).unwrap();
        let seq = self.extender.extend(packet.sequence).unwrap();
        self.buffer.enqueue(packet.into_unit(seq, 0));
    }

    fn drain(&mut self, now_us: i64) -> Vec<AccessUnit> {
        std::iter::from_fn(|| self.buffer.dequeue_next(now_us))
            .map(|d| AccessUnit::from(d.unit))
            .collect()
    }

    fn nacks(&self) -> Vec<Bytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LossEvent::RetransmissionRequested(r) => Some(
                    GenericNack::for_request(FEEDBACK_SSRC, SSRC, r)
                        .to_bytes()
                        .freeze(),
                ),
                LossEvent::DeclaredLost { .. } => None,
            })
            .collect()
    }
}

#[test]
fn test_missing_packet_requested_then_recovered() {
    let mut rx = Receiver::new();

    rx.receive(datagram(100, 0));
    rx.receive(datagram(101, 3_000));
    assert_eq!(rx.drain(0).len(), 2);

    rx.receive(datagram(103, 9_000));
    assert!(rx.drain(1_000).is_empty());
    assert!(rx.drain(2_000).is_empty());

    let nacks = rx.nacks();
    assert_eq!(nacks.len(), 1);
    let nack = GenericNack::from_bytes(&nacks[0]).unwrap();
    assert_eq!(nack.sender_ssrc, FEEDBACK_SSRC);
    assert_eq!(nack.media_ssrc, SSRC);
    assert_eq!(nack.lost_sequences(), vec![102]);

    rx.receive(datagram(102, 6_000));
    let units = rx.drain(20_000);
    let pts: Vec<i64> = units.iter().map(|u| u.pts_us).collect();
    // 90 kHz RTP clock
    assert_eq!(pts, vec![66_666, 100_000]);
    assert_eq!(rx.buffer.stats().recovered, 1);
}

#[test]
fn test_unrecovered_packet_skipped_after_grace() {
    let mut rx = Receiver::new();
    rx.receive(datagram(7, 0));
    rx.drain(0);

    rx.receive(datagram(9, 6_000));
    rx.drain(10_000);
    assert_eq!(rx.nacks().len(), 1);

    let units = rx.drain(60_000);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].payload, Bytes::from_static(&[0, 9]));
    assert!(rx
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, LossEvent::DeclaredLost { first, last }
            if first.wire() == 8 && last.wire() == 8)));

    // Retransmission arriving after the skip is dropped as stale
    rx.receive(datagram(8, 3_000));
    assert!(rx.drain(61_000).is_empty());
    assert_eq!(rx.buffer.stats().stale, 1);
}

#[test]
fn test_nack_across_sequence_wrap() {
    let mut rx = Receiver::new();
    rx.receive(datagram(65534, 0));
    rx.receive(datagram(65535, 3_000));
    rx.receive(datagram(1, 9_000));
    assert_eq!(rx.drain(0).len(), 2);
    rx.drain(1_000);

    let nack = GenericNack::from_bytes(&rx.nacks()[0]).unwrap();
    assert_eq!(nack.pid, 0);

    rx.receive(datagram(0, 6_000));
    let units = rx.drain(2_000);
    assert_eq!(units.len(), 2);
    assert_eq!(rx.buffer.last_delivered().map(|s| s.cycles()), Some(1));
}
