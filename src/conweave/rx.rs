//! The destination-ToR state machine: epoch matching, out-of-order
//! detection, VOQ scheduling, and REPLY/NOTIFY emission.

use tracing::{debug, warn};

use super::{ConweaveRouting, Voq};
use crate::errors::{Error, Result};
use crate::packet::Packet;
use crate::path;
use crate::sim::{EventQueue, Nanos};
use crate::switch::Step;
use crate::wire::{data, notify, reply, Tag};

impl ConweaveRouting {
    /// Incoming inter-pod DATA at the destination ToR.
    pub(super) fn on_data_in(&mut self, mut pkt: Packet, q: &mut EventQueue) -> Result<Vec<Step>> {
        let now = q.now();
        let t = match pkt.tag.take() {
            Some(Tag::Data(t)) => t,
            _ => return Err(Error("on_data_in without a data tag".into())),
        };
        let flowkey = path::flow_key(pkt.sip, pkt.dip, pkt.sport, pkt.dport);
        let voq_exists = self.voqs.contains_key(&flowkey);
        let default_voq_wait = self.default_voq_wait;
        let extra_voq_flush = self.extra_voq_flush;

        let e = self.rx_table.entry(flowkey).or_default();
        e.active = now;

        // epoch match: older epochs bypass all state
        if e.epoch > t.epoch {
            return Ok(vec![Step::Deliver { pkt }]);
        }
        let newer = e.epoch < t.epoch;
        if newer {
            e.epoch = t.epoch;
        }

        if t.phase == 0 {
            e.phase0_tx = t.tx_time;
            e.phase0_rx = now;
        }
        let phase0_tx = e.phase0_tx;
        let phase0_rx = e.phase0_rx;

        let mut out_of_order = false;
        if newer {
            e.phase = if t.flag == data::Flag::Tail { 1 } else { 0 };
            if t.phase > e.phase {
                out_of_order = true;
            }
            e.phase0_cache = t.phase == 0;
            if e.reordering || voq_exists {
                // the old VOQ keeps flushing on its schedule; the new epoch
                // proceeds independently
                warn!(
                    switch = self.switch_id,
                    flowkey,
                    epoch = t.epoch,
                    "new epoch while reordering is in progress; consider a larger tx expiry"
                );
            }
        } else {
            if t.flag == data::Flag::Tail {
                if !e.reordering {
                    e.phase = 1;
                }
                // while reordering, the phase flips when the VOQ flushes
            } else if e.phase < t.phase {
                out_of_order = true;
            }
            if t.phase == 0 {
                e.phase0_cache = true;
            }
        }
        let phase0_cache = e.phase0_cache;

        if t.flag == data::Flag::Tail || t.phase == 1 {
            e.tail_time = t.tail_time;
        }
        let tail_time = e.tail_time;
        let reordering = e.reordering;

        // predicted TAIL arrival: the source-side gap between the TAIL and
        // the last phase-0 departure, replayed from the phase-0 arrival
        let tx_timegap = if phase0_cache {
            tail_time.saturating_sub(phase0_tx)
        } else {
            default_voq_wait
        };

        let expected_flush: Nanos = if t.phase == 1 {
            if out_of_order {
                let anchor = if phase0_cache { phase0_rx } else { now };
                anchor + tx_timegap + extra_voq_flush
            } else {
                0
            }
        } else {
            debug_assert!(phase0_cache);
            if t.flag == data::Flag::Tail {
                // drain almost immediately
                now + 1
            } else {
                now + tx_timegap + extra_voq_flush
            }
        };

        debug!(
            switch = self.switch_id,
            flowkey,
            pkt_epoch = t.epoch,
            pkt_phase = t.phase,
            flag = ?t.flag,
            out_of_order,
            phase0_cache,
            voqs = self.voqs.len(),
            "conweave destination tor"
        );

        let mut enqueue = false;
        if t.phase == 0 {
            if reordering {
                let voq = self
                    .voqs
                    .get_mut(&flowkey)
                    .expect("reordering implies an active VOQ");
                // a VOQ left over from a previous epoch keeps its own
                // schedule; only its own epoch may move the deadline
                if voq.epoch() == t.epoch {
                    if t.flag == data::Flag::Tail {
                        self.counters.flush_voq_by_tail += 1;
                    }
                    let rel = expected_flush.saturating_sub(now);
                    voq.reschedule(rel, q);
                }
            }
        } else if out_of_order {
            let stale_voq = self
                .voqs
                .get(&flowkey)
                .map_or(false, |v| v.epoch() != t.epoch);
            if stale_voq {
                // the VOQ belongs to the previous epoch; this packet flows
                // around it
            } else {
                enqueue = true;
                if !reordering {
                    self.rx_table
                        .get_mut(&flowkey)
                        .expect("entry just touched")
                        .reordering = true;
                    let rel = expected_flush.saturating_sub(now);
                    let mut voq =
                        Voq::new(flowkey, pkt.dip, self.switch_id, t.epoch, extra_voq_flush);
                    voq.reschedule(rel, q);
                    self.voqs.insert(flowkey, voq);
                }
                // a later out-of-order packet never moves the deadline
            }
        } else if !newer {
            // in-order phase 1: any surviving VOQ belongs to an older epoch
            debug_assert!(self
                .voqs
                .get(&flowkey)
                .map_or(true, |v| v.epoch() != t.epoch));
        }

        let mut steps = Vec::new();
        if self.path_aware && pkt.congestion_experienced() {
            steps.push(self.make_notify(&pkt, t.path));
        }
        if t.flag == data::Flag::Init {
            debug_assert_eq!(t.phase, 0);
            steps.push(self.make_reply(&pkt, reply::Flag::Init, t.epoch));
        }
        if t.flag == data::Flag::Tail {
            debug_assert_eq!(t.phase, 0);
            steps.push(self.make_reply(&pkt, reply::Flag::Tail, t.epoch));
        }

        if enqueue {
            self.voqs
                .get_mut(&flowkey)
                .expect("VOQ exists when enqueueing")
                .enqueue(pkt);
            self.counters.out_of_order += 1;
        } else {
            steps.push(Step::Deliver { pkt });
        }
        Ok(steps)
    }

    /// The flush timer fired: drain the VOQ in order, settle the flow back
    /// into phase 1, and delete the VOQ. No-ops if the VOQ is already gone.
    pub(crate) fn on_voq_flush(&mut self, flowkey: u64, _q: &mut EventQueue) -> Vec<Step> {
        let mut voq = match self.voqs.remove(&flowkey) {
            Some(v) => v,
            None => return vec![],
        };
        self.counters.flush_voq_total += 1;
        self.counters.voq_size_history.push(voq.len() as u32);
        self.counters.flush_est_error.extend_from_slice(voq.est_error());

        let e = self
            .rx_table
            .get_mut(&flowkey)
            .expect("aging never deletes a flow with an active VOQ");
        debug_assert!(e.reordering);
        e.reordering = false;
        e.phase = 1;

        debug!(switch = self.switch_id, flowkey, drained = voq.len(), "voq flush");
        voq.drain().into_iter().map(|pkt| Step::Deliver { pkt }).collect()
    }

    fn make_reply(&mut self, pkt: &Packet, flag: reply::Flag, epoch: u32) -> Step {
        let phase = match flag {
            reply::Flag::Init => {
                self.counters.reply_init_sent += 1;
                0
            }
            reply::Flag::Tail => {
                self.counters.reply_tail_sent += 1;
                1
            }
        };
        let mut reply = pkt.control_reply_to();
        reply.tag = Some(Tag::Reply(reply::Tag { flag, epoch, phase }));
        debug!(switch = self.switch_id, ?flag, epoch, "send reply");
        Step::Deliver { pkt: reply }
    }

    fn make_notify(&mut self, pkt: &Packet, congested_path: u32) -> Step {
        self.counters.notify_sent += 1;
        let mut fb = pkt.control_reply_to();
        fb.tag = Some(Tag::Notify(notify::Tag { path: congested_path }));
        debug!(switch = self.switch_id, path = congested_path, "send notify");
        Step::Deliver { pkt: fb }
    }
}
