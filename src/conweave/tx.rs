//! The source-ToR state machine: epoch/phase bookkeeping on outgoing DATA,
//! and REPLY/NOTIFY consumption.

use tracing::debug;

use super::ConweaveRouting;
use crate::errors::{Error, Result};
use crate::packet::Packet;
use crate::path;
use crate::sim::EventQueue;
use crate::switch::Step;
use crate::wire::{data, reply, Tag};

impl ConweaveRouting {
    /// Outgoing inter-pod DATA at the source ToR.
    pub(super) fn on_data_out(
        &mut self,
        mut pkt: Packet,
        dst_tor: u32,
        q: &mut EventQueue,
    ) -> Result<Vec<Step>> {
        let now = q.now();
        let flowkey = path::flow_key(pkt.sip, pkt.dip, pkt.sport, pkt.dport);
        let base_rtt = self
            .base_rtt
            .get(&dst_tor)
            .copied()
            .ok_or_else(|| Error(format!("no base RTT toward ToR {}", dst_tor)))?;

        let new_connection = !self.tx_table.contains_key(&flowkey);
        let extra_reply_deadline = self.extra_reply_deadline;
        let tx_expiry = self.tx_expiry;

        // classify the packet before mutating the entry: a new connection
        // always counts as expired, expired shadows stabilized, and a
        // reply-timeout fires only in the absence of both
        let e = self.tx_table.entry(flowkey).or_default();
        let expired = new_connection || e.active + tx_expiry < now;
        let stabilized = !expired && e.stabilized;
        if expired || stabilized {
            e.stabilized = false;
        }
        e.active = now;
        let reply_timeout =
            !expired && !stabilized && e.reply_deadline.map_or(false, |d| d < now);

        if expired || stabilized {
            // open a new epoch; the INIT below doubles as an RTT probe
            e.reply_deadline = Some(now + base_rtt + extra_reply_deadline);
            e.epoch += 1;
            e.phase = 0;
        } else if reply_timeout {
            // no more timeouts for this epoch; the TAIL below marks the cut
            e.reply_deadline = None;
        }

        let pkt_epoch = e.epoch;
        let pkt_phase = if reply_timeout {
            debug_assert_eq!(e.phase, 0);
            e.phase = 1; // subsequent packets carry phase 1
            0 // the TAIL itself is still labeled phase 0
        } else if expired || stabilized {
            0
        } else {
            e.phase
        };

        let (choice, found_good) = self.pick_path(dst_tor, new_connection, now)?;
        let e = self.tx_table.get_mut(&flowkey).expect("entry just inserted");

        let curr_path = if e.path.is_none() {
            debug_assert!(new_connection);
            e.path = Some(choice);
            choice
        } else if expired {
            if !new_connection {
                self.counters.reroute += 1;
            }
            e.path = Some(choice);
            choice
        } else if stabilized {
            // a fresh flowcut starts on a freshly sampled path; not counted
            // as a reroute
            e.path = Some(choice);
            choice
        } else if reply_timeout {
            // the TAIL goes out on the old path; later packets take the new one
            let old = e.path.expect("existing connection has a path");
            self.counters.reroute += 1;
            e.path = Some(choice);
            old
        } else {
            e.path.expect("existing connection has a path")
        };

        if expired || stabilized {
            e.tail_time = 0;
        } else if reply_timeout {
            e.tail_time = now;
        }
        let tail_time = e.tail_time;

        let flag = if expired || stabilized {
            data::Flag::Init
        } else if reply_timeout {
            data::Flag::Tail
        } else {
            data::Flag::Data
        };

        debug!(
            switch = self.switch_id,
            flowkey,
            epoch = pkt_epoch,
            phase = pkt_phase,
            path = curr_path,
            ?flag,
            expired,
            stabilized,
            reply_timeout,
            found_good,
            "conweave source tor"
        );

        pkt.tag = Some(Tag::Data(data::Tag {
            path: curr_path,
            hop: 0,
            epoch: pkt_epoch,
            phase: pkt_phase,
            tx_time: now,
            tail_time,
            flag,
        }));
        let out_port = path::port_of(curr_path, 0);
        Ok(vec![Step::Forward { pkt, port: out_port }])
    }

    /// REPLY consumed at the flow's source ToR. Stale replies (epoch or
    /// phase mismatch, or no entry at all) are silently dropped.
    pub(super) fn on_reply_in(&mut self, pkt: Packet, q: &mut EventQueue) -> Result<Vec<Step>> {
        let now = q.now();
        let t = match pkt.tag {
            Some(Tag::Reply(t)) => t,
            _ => return Err(Error("on_reply_in without a reply tag".into())),
        };
        // the reply carries the reversed tuple; flip it back to the data
        // direction to address the TX entry
        let flowkey = path::flow_key(pkt.dip, pkt.sip, pkt.dport, pkt.sport);

        if let Some(e) = self.tx_table.get_mut(&flowkey) {
            if t.epoch == e.epoch && t.phase == e.phase {
                match t.flag {
                    reply::Flag::Init => {
                        if e.reply_deadline.map_or(false, |d| now < d) {
                            e.stabilized = true;
                            e.reply_deadline = None;
                            self.counters.timely_init_replied += 1;
                            debug!(switch = self.switch_id, flowkey, epoch = t.epoch, "init replied timely");
                        }
                        // a late INIT reply is ignored
                    }
                    reply::Flag::Tail => {
                        // CLEAR: the reordering of this flowcut is resolved
                        e.stabilized = true;
                        e.reply_deadline = None;
                        self.counters.timely_tail_replied += 1;
                        debug!(switch = self.switch_id, flowkey, epoch = t.epoch, "tail replied");
                    }
                }
            }
        }
        Ok(vec![])
    }

    /// NOTIFY consumed at the flow's source ToR: blacklist the path.
    pub(super) fn on_notify_in(&mut self, pkt: Packet, q: &mut EventQueue) -> Result<Vec<Step>> {
        let t = match pkt.tag {
            Some(Tag::Notify(t)) => t,
            _ => return Err(Error("on_notify_in without a notify tag".into())),
        };
        debug!(switch = self.switch_id, path = t.path, "notify: path paused");
        self.path_table.pause(t.path, q.now() + self.path_pause);
        Ok(vec![])
    }
}
