//! Per-flow Virtual Output Queue with a single timed flush deadline.
//!
//! A VOQ buffers the out-of-order phase-1 packets of one flow at the
//! destination ToR and releases them, in arrival order, when its flush
//! timer fires. There is at most one scheduled flush per VOQ; rescheduling
//! cancels the previous one. The VOQ holds only its flow key and switch id,
//! never a reference into engine state; the engine drains and deletes it
//! when the flush timer fires.

use std::collections::VecDeque;

use crate::packet::Packet;
use crate::sim::{EventHandle, EventQueue, Nanos, Timer};

pub struct Voq {
    flowkey: u64,
    dip: u32,
    switch_id: u32,
    /// The epoch whose reordering this VOQ absorbs. Packets of a later
    /// epoch never touch it.
    epoch: u32,
    fifo: VecDeque<Packet>,
    /// The pending flush, with its absolute deadline.
    flush: Option<(EventHandle, Nanos)>,
    extra_flush: Nanos,
    /// Estimation error samples: how much earlier the replaced deadline
    /// would have fired than the padding accounts for.
    est_error: Vec<i64>,
}

impl Voq {
    pub fn new(flowkey: u64, dip: u32, switch_id: u32, epoch: u32, extra_flush: Nanos) -> Voq {
        Voq {
            flowkey,
            dip,
            switch_id,
            epoch,
            fifo: VecDeque::new(),
            flush: None,
            extra_flush,
            est_error: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn enqueue(&mut self, pkt: Packet) {
        self.fifo.push_back(pkt);
    }

    /// Cancel any pending flush and install one `rel` from now. The
    /// replaced deadline's estimation error is kept for diagnostics.
    pub fn reschedule(&mut self, rel: Nanos, q: &mut EventQueue) {
        if let Some((h, at)) = self.flush.take() {
            self.est_error
                .push(at as i64 - q.now() as i64 - self.extra_flush as i64);
            q.cancel(h);
        }
        let h = q.schedule_in(
            rel,
            self.switch_id,
            Timer::VoqFlush {
                flowkey: self.flowkey,
            },
        );
        self.flush = Some((h, q.now() + rel));
    }

    /// Hand out the buffered packets in arrival order. Called exactly once,
    /// when the flush fires; the engine deletes the VOQ right after.
    pub fn drain(&mut self) -> VecDeque<Packet> {
        self.flush = None;
        std::mem::take(&mut self.fifo)
    }

    /// Number of live scheduled flush events: always 0 or 1.
    pub fn pending_flushes(&self, q: &EventQueue) -> usize {
        match &self.flush {
            Some((h, _)) if q.is_pending(*h) => 1,
            _ => 0,
        }
    }

    pub fn deadline(&self) -> Option<Nanos> {
        self.flush.map(|(_, at)| at)
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn dip(&self) -> u32 {
        self.dip
    }

    pub fn est_error(&self) -> &[i64] {
        &self.est_error
    }
}

#[cfg(test)]
mod test {
    use super::Voq;
    use crate::packet::Packet;
    use crate::sim::EventQueue;

    fn pkt(seq: u32) -> Packet {
        let mut p = Packet::data(1, 2, 3, 4, 3, 1000);
        p.seq = seq;
        p
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let mut q = EventQueue::new();
        let mut voq = Voq::new(7, 2, 0, 1, 32_000);
        voq.reschedule(100, &mut q);
        for i in 0..5 {
            voq.enqueue(pkt(i));
        }
        let drained: Vec<u32> = voq.drain().into_iter().map(|p| p.seq).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(voq.is_empty());
    }

    #[test]
    fn at_most_one_pending_flush() {
        let mut q = EventQueue::new();
        let mut voq = Voq::new(7, 2, 0, 1, 32_000);
        assert_eq!(voq.pending_flushes(&q), 0);
        voq.reschedule(100, &mut q);
        assert_eq!(voq.pending_flushes(&q), 1);
        voq.reschedule(50, &mut q);
        assert_eq!(voq.pending_flushes(&q), 1);
        assert_eq!(voq.deadline(), Some(50));
        // the replaced deadline left an estimation error sample
        assert_eq!(voq.est_error().len(), 1);
        assert_eq!(voq.est_error()[0], 100 - 32_000);
    }
}
