//! RTP receive path shared by the receiver tool and its tests
//!
//! Datagrams are parsed, their sequence numbers extended, and the resulting
//! units pushed through a [`ReorderBuffer`]. Retransmission requests raised
//! by the buffer are turned into generic NACKs for the caller to send, and
//! the reception counters into periodic receiver reports.

use crate::stats::ReceiverStats;
use bytes::Bytes;
use castsink_protocol::{
    GenericNack, LossEvent, ReceiverReport, ReorderBuffer, ReorderConfig, ReportBlock, RtpError,
    RtpPacket, SeqExtender,
};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

/// Media arriving on a single RTP stream
pub struct RtpReceiver {
    extender: SeqExtender,
    reorder: ReorderBuffer,
    events: Arc<Mutex<Vec<LossEvent>>>,
    media_ssrc: Option<u32>,
    sender_ssrc: u32,
    stats: ReceiverStats,
}

impl RtpReceiver {
    pub fn new(config: ReorderConfig, sender_ssrc: u32) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reorder = ReorderBuffer::with_notifier(config, move |event| sink.lock().push(event));

        RtpReceiver {
            extender: SeqExtender::new(),
            reorder,
            events,
            media_ssrc: None,
            sender_ssrc,
            stats: ReceiverStats::default(),
        }
    }

    /// Feed one datagram
    ///
    /// The first stream seen is locked onto; packets from other SSRCs are
    /// counted and dropped.
    pub fn on_datagram(&mut self, datagram: Bytes) -> Result<(), RtpError> {
        self.stats.packets += 1;
        self.stats.bytes_in += datagram.len() as u64;

        let packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                return Err(e);
            }
        };

        match self.media_ssrc {
            None => {
                tracing::info!(
                    "receiving stream ssrc={:#010x} pt={} starting at seq {}",
                    packet.ssrc,
                    packet.payload_type,
                    packet.sequence
                );
                self.media_ssrc = Some(packet.ssrc);
            }
            Some(ssrc) if ssrc != packet.ssrc => {
                tracing::debug!("ignoring packet from ssrc {:#010x}", packet.ssrc);
                self.stats.foreign_ssrc += 1;
                return Ok(());
            }
            Some(_) => {}
        }

        match self.extender.extend(packet.sequence) {
            Some(seq) => {
                self.reorder.enqueue(packet.into_unit(seq, 0));
            }
            None => self.stats.rejected_seq += 1,
        }
        Ok(())
    }

    /// Write every unit the reorder policy releases at `now_us`
    pub fn drain_to(&mut self, now_us: i64, out: &mut dyn Write) -> io::Result<usize> {
        let mut count = 0;
        while let Some(delivered) = self.reorder.dequeue_next(now_us) {
            if delivered.discontinuity {
                tracing::info!("stream starts at unit {}", delivered.unit.seq);
            }
            out.write_all(&delivered.unit.payload)?;
            self.stats.bytes_out += delivered.unit.len() as u64;
            count += 1;
        }
        Ok(count)
    }

    /// NACKs for every retransmission requested since the last call
    pub fn take_nacks(&mut self) -> Vec<GenericNack> {
        let events: Vec<LossEvent> = self.events.lock().drain(..).collect();
        let Some(media_ssrc) = self.media_ssrc else {
            return Vec::new();
        };

        let mut nacks = Vec::new();
        for event in events {
            match event {
                LossEvent::RetransmissionRequested(request) => {
                    nacks.push(GenericNack::for_request(self.sender_ssrc, media_ssrc, &request));
                }
                LossEvent::DeclaredLost { first, last } => {
                    tracing::warn!("lost units {}..={}", first, last);
                }
            }
        }
        self.stats.nacks_sent += nacks.len() as u64;
        nacks
    }

    /// Time the reorder buffer will next give up on a gap
    pub fn next_deadline_us(&self) -> Option<i64> {
        self.reorder.skip_deadline_us()
    }

    /// Snapshot of the counters
    ///
    /// Loss figures cover the interval since the last receiver report.
    pub fn snapshot(&self) -> ReceiverStats {
        let mut stats = self.stats;
        stats.reorder = self.reorder.stats();
        stats.pending_units = self.reorder.len();
        stats.report = self
            .extender
            .extended_max()
            .map(|_| self.extender.peek_report());
        stats
    }

    /// Receiver report for the locked stream, starting a new loss interval
    ///
    /// `None` until a stream has been locked onto.
    pub fn receiver_report(&mut self) -> Option<ReceiverReport> {
        let media_ssrc = self.media_ssrc?;
        self.extender.extended_max()?;
        let block = ReportBlock::from_reception(media_ssrc, &self.extender.report());
        Some(ReceiverReport::single(self.sender_ssrc, block))
    }

    pub fn media_ssrc(&self) -> Option<u32> {
        self.media_ssrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(seq: u16, ssrc: u32) -> Bytes {
        RtpPacket::new(33, seq, seq as u32 * 3000, ssrc, Bytes::from(vec![seq as u8; 4]))
            .to_bytes()
            .freeze()
    }

    #[test]
    fn test_reordered_stream_written_in_order() {
        let mut rx = RtpReceiver::new(ReorderConfig::default(), 1);
        let mut out = Vec::new();

        for seq in [5u16, 6, 8] {
            rx.on_datagram(datagram(seq, 42)).unwrap();
            rx.drain_to(0, &mut out).unwrap();
        }
        rx.drain_to(1_000, &mut out).unwrap();

        let nacks = rx.take_nacks();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].pid, 7);
        assert_eq!(nacks[0].media_ssrc, 42);
        assert_eq!(nacks[0].sender_ssrc, 1);

        rx.on_datagram(datagram(7, 42)).unwrap();
        rx.drain_to(2_000, &mut out).unwrap();

        assert_eq!(out, [[5u8; 4], [6; 4], [7; 4], [8; 4]].concat());
        assert!(rx.take_nacks().is_empty());
    }

    #[test]
    fn test_foreign_ssrc_and_garbage_counted() {
        let mut rx = RtpReceiver::new(ReorderConfig::default(), 1);
        rx.on_datagram(datagram(1, 42)).unwrap();
        rx.on_datagram(datagram(2, 43)).unwrap();
        assert!(rx.on_datagram(Bytes::from_static(b"junk")).is_err());

        let stats = rx.snapshot();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.foreign_ssrc, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.pending_units, 1);
        assert_eq!(rx.media_ssrc(), Some(42));
    }

    #[test]
    fn test_receiver_report_covers_interval() {
        let mut rx = RtpReceiver::new(ReorderConfig::default(), 1);
        assert!(rx.receiver_report().is_none());

        for seq in [10u16, 11, 13] {
            rx.on_datagram(datagram(seq, 42)).unwrap();
        }
        // Stats do not close the interval
        assert!(rx.snapshot().report.is_some());

        let report = rx.receiver_report().unwrap();
        assert_eq!(report.sender_ssrc, 1);
        assert_eq!(report.blocks.len(), 1);
        let block = report.blocks[0];
        assert_eq!(block.ssrc, 42);
        assert_eq!(block.extended_max.as_raw(), 13);
        assert_eq!(block.cumulative_lost, 1);
        assert_eq!(block.fraction_lost, ((1u32 << 8) / 4) as u8);

        let next = rx.receiver_report().unwrap();
        assert_eq!(next.blocks[0].fraction_lost, 0);
        assert_eq!(next.blocks[0].cumulative_lost, 1);

        let wire = report.to_compound("rx@test", "castsink").unwrap();
        assert_eq!(ReceiverReport::from_bytes(&wire).unwrap(), report);
    }

    #[test]
    fn test_sequence_wrap_keeps_order() {
        let mut rx = RtpReceiver::new(ReorderConfig::default(), 1);
        let mut out = Vec::new();
        for seq in [65534u16, 0, 65535, 1] {
            rx.on_datagram(datagram(seq, 9)).unwrap();
        }
        rx.drain_to(0, &mut out).unwrap();
        assert_eq!(out, [[254u8; 4], [255; 4], [0; 4], [1; 4]].concat());
    }
}
