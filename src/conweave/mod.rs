//! CONWEAVE: proactive flowcut rerouting with in-network reorder repair.
//!
//! Two coordinated state machines run on the ToR pair of every inter-pod
//! flow. The source ToR slices the flow into epochs: each epoch opens with
//! an INIT packet that doubles as an RTT probe, and a missing REPLY before
//! the deadline forces a reroute, marked by a TAIL packet on the old path
//! while subsequent (phase 1) packets take a new one. The destination ToR
//! detects phase-1 packets overtaking phase 0, parks them in a per-flow
//! Virtual Output Queue, and flushes the queue in order once the TAIL
//! arrives or a deadline inferred from phase-0 timing elapses. Congested
//! paths reported by ECN-triggered NOTIFY packets are blacklisted at the
//! source for a pause interval.
//!
//! Terminology: an epoch is one flowcut; phase 0/1 are the pre-/post-reroute
//! packet groups inside it. "Stabilized" means no reordering is in flight,
//! so the next packet may open a new epoch. REPLY(INIT) answers the RTT
//! probe; REPLY(TAIL) confirms flowcut closure.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::Config;
use crate::errors::{EmptyPathSetError, Error, MissingTagError, Result};
use crate::packet::{Packet, PROT_NACK, PROT_UDP};
use crate::path::{self, PathId, PathTable};
use crate::sim::{EventQueue, Nanos, Timer};
use crate::switch::Step;
use crate::wire::Tag;

mod rx;
mod tx;
mod voq;

pub use self::voq::Voq;

/// Source-ToR per-flow state.
#[derive(Clone, Debug, Default)]
pub struct TxState {
    /// Set by a timely REPLY; cleared when the next packet opens an epoch.
    pub stabilized: bool,
    pub active: Nanos,
    /// `None` means disarmed (no REPLY expected).
    pub reply_deadline: Option<Nanos>,
    /// Incremented on every expired/stabilized event; the first data packet
    /// of a connection therefore flows with epoch 1.
    pub epoch: u32,
    /// 0 before the in-epoch reroute, 1 after.
    pub phase: u32,
    pub path: Option<PathId>,
    /// Departure time of this epoch's TAIL packet, or 0.
    pub tail_time: Nanos,
}

/// Destination-ToR per-flow state.
#[derive(Clone, Debug)]
pub struct RxState {
    pub active: Nanos,
    pub epoch: u32,
    pub phase: u32,
    /// Source-ToR departure time of the latest phase-0 packet.
    pub phase0_tx: Nanos,
    /// Local arrival time of the latest phase-0 packet.
    pub phase0_rx: Nanos,
    /// Whether any phase-0 packet of the current epoch has been seen, i.e.
    /// whether RTT information is available for the flush prediction.
    pub phase0_cache: bool,
    pub tail_time: Nanos,
    /// Whether a VOQ is currently absorbing out-of-order packets.
    pub reordering: bool,
}

impl Default for RxState {
    fn default() -> RxState {
        RxState {
            active: 0,
            // the source always starts with epoch 1
            epoch: 1,
            phase: 0,
            phase0_tx: 0,
            phase0_rx: 0,
            phase0_cache: false,
            tail_time: 0,
            reordering: false,
        }
    }
}

/// Per-switch CONWEAVE statistics, snapshotted for post-run analysis.
#[derive(Clone, Debug, Default)]
pub struct ConweaveCounters {
    pub reply_init_sent: u64,
    pub reply_tail_sent: u64,
    pub timely_init_replied: u64,
    pub timely_tail_replied: u64,
    pub notify_sent: u64,
    pub reroute: u64,
    pub out_of_order: u64,
    /// All VOQ flushes; the timed-out ones may create a micro-reorder.
    pub flush_voq_total: u64,
    /// Flushes forced forward by a phase-0 TAIL (no reordering issue).
    pub flush_voq_by_tail: u64,
    pub voq_size_history: Vec<u32>,
    pub flush_est_error: Vec<i64>,
}

pub struct ConweaveRouting {
    switch_id: u32,
    is_tor: bool,

    extra_reply_deadline: Nanos,
    extra_voq_flush: Nanos,
    tx_expiry: Nanos,
    default_voq_wait: Nanos,
    path_pause: Nanos,
    path_aware: bool,
    aging_time: Nanos,

    /// dstToR -> enumerated paths. Static after construction.
    routing: HashMap<u32, BTreeSet<PathId>>,
    /// dstToR -> nominal round-trip. Static after construction.
    base_rtt: HashMap<u32, Nanos>,

    path_table: PathTable,
    tx_table: HashMap<u64, TxState>,
    rx_table: HashMap<u64, RxState>,
    voqs: HashMap<u64, Voq>,

    rng: StdRng,
    aging_armed: bool,
    counters: ConweaveCounters,
}

impl ConweaveRouting {
    pub fn new(
        switch_id: u32,
        is_tor: bool,
        cfg: &Config,
        routing: HashMap<u32, BTreeSet<PathId>>,
        base_rtt: HashMap<u32, Nanos>,
        rng_seed: u64,
    ) -> ConweaveRouting {
        ConweaveRouting {
            switch_id,
            is_tor,
            extra_reply_deadline: cfg.extra_reply_deadline,
            extra_voq_flush: cfg.extra_voq_flush_time,
            tx_expiry: cfg.tx_expiry_time,
            default_voq_wait: cfg.default_voq_wait,
            path_pause: cfg.path_pause_time,
            path_aware: cfg.path_aware_rerouting,
            aging_time: cfg.aging_time,
            routing,
            base_rtt,
            path_table: PathTable::new(cfg.path_table_size, switch_id),
            tx_table: HashMap::new(),
            rx_table: HashMap::new(),
            voqs: HashMap::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            aging_armed: false,
            counters: ConweaveCounters::default(),
        }
    }

    /// Every CONWEAVE-mode packet at this switch is hijacked to here.
    pub fn route_input(
        &mut self,
        mut pkt: Packet,
        src_tor: u32,
        dst_tor: u32,
        q: &mut EventQueue,
    ) -> Result<Vec<Step>> {
        if !self.aging_armed {
            debug!(switch = self.switch_id, "starting conweave aging event");
            q.schedule_in(self.aging_time, self.switch_id, Timer::ConweaveAging);
            self.aging_armed = true;
        }

        // intra-pod traffic has only one path
        if src_tor == dst_tor {
            return Ok(vec![Step::Deliver { pkt }]);
        }

        if pkt.l3_prot != PROT_UDP && pkt.l3_prot != PROT_NACK {
            // ACK/PFC/CNP: prioritized flow-ECMP
            return Ok(vec![Step::Deliver { pkt }]);
        }

        let has_reply = matches!(pkt.tag, Some(Tag::Reply(_)));
        let has_notify = matches!(pkt.tag, Some(Tag::Notify(_)));
        if pkt.l3_prot == PROT_NACK {
            // 0xFD carries both plain (N)ACKs and CONWEAVE control packets
            if !has_reply && !has_notify {
                return Ok(vec![Step::Deliver { pkt }]);
            }
            if !self.is_tor {
                // control packets use flow-ECMP at non-ToR switches
                return Ok(vec![Step::Deliver { pkt }]);
            }
        }

        if self.is_tor {
            if self.switch_id == src_tor {
                // the source ToR sees only untagged UDP data
                if pkt.l3_prot != PROT_UDP || pkt.tag.is_some() {
                    return Err(Error(format!(
                        "source ToR {} got an already-tagged or non-data packet",
                        self.switch_id
                    )));
                }
                return self.on_data_out(pkt, dst_tor, q);
            }
            if self.switch_id == dst_tor {
                return match pkt.tag {
                    Some(Tag::Data(_)) => self.on_data_in(pkt, q),
                    Some(Tag::Reply(_)) => self.on_reply_in(pkt, q),
                    Some(Tag::Notify(_)) => self.on_notify_in(pkt, q),
                    _ => Err(MissingTagError.into()),
                };
            }
            return Err(Error(format!(
                "ToR {} is neither source ({}) nor destination ({}) ToR",
                self.switch_id, src_tor, dst_tor
            )));
        }

        // agg/core switch: advance the hop and index the embedded path byte
        match pkt.tag.take() {
            Some(Tag::Data(mut t)) => {
                t.hop += 1;
                let out_port = path::port_of(t.path, t.hop);
                debug!(
                    switch = self.switch_id,
                    epoch = t.epoch,
                    phase = t.phase,
                    out_port,
                    "conweave transit"
                );
                pkt.tag = Some(Tag::Data(t));
                Ok(vec![Step::Forward { pkt, port: out_port }])
            }
            _ => Err(MissingTagError.into()),
        }
    }

    /// PATH-CHOICE: sample two paths; prefer the first that is not
    /// blacklisted, else the second, else the first regardless. Returns the
    /// pick and whether it was good. A new connection always takes the
    /// first sample.
    fn pick_path(&mut self, dst_tor: u32, new_connection: bool, now: Nanos) -> Result<(PathId, bool)> {
        let paths = match self.routing.get(&dst_tor) {
            Some(s) if !s.is_empty() => s,
            _ => return Err(EmptyPathSetError(dst_tor).into()),
        };
        let n = paths.len();
        let s1 = *paths.iter().nth(self.rng.gen_range(0..n)).expect("nonempty");
        if !self.path_aware {
            return Ok((s1, true));
        }
        let s2 = *paths.iter().nth(self.rng.gen_range(0..n)).expect("nonempty");

        if new_connection {
            let good = self.path_table.is_good(s1, now);
            return Ok((s1, good));
        }
        if self.path_table.is_good(s1, now) {
            Ok((s1, true))
        } else if self.path_table.is_good(s2, now) {
            Ok((s2, true))
        } else {
            Ok((s1, false))
        }
    }

    /// Aging sweep over both per-flow tables. An entry whose flow still
    /// owns a VOQ is never deleted, so a flush cannot target a missing
    /// entry.
    pub fn on_aging(&mut self, q: &mut EventQueue) {
        let now = q.now();
        let aging = self.aging_time;
        self.tx_table.retain(|_, e| now - e.active <= aging);
        let voqs = &self.voqs;
        self.rx_table
            .retain(|k, e| voqs.contains_key(k) || now - e.active <= aging);
        q.schedule_in(aging, self.switch_id, Timer::ConweaveAging);
    }

    /// Whether PATH-CHOICE would currently reject this path.
    pub fn path_blacklisted(&self, p: PathId, now: Nanos) -> bool {
        !self.path_table.is_good(p, now)
    }

    pub fn counters(&self) -> &ConweaveCounters {
        &self.counters
    }

    pub fn tx_state(&self, flowkey: u64) -> Option<&TxState> {
        self.tx_table.get(&flowkey)
    }

    pub fn rx_state(&self, flowkey: u64) -> Option<&RxState> {
        self.rx_table.get(&flowkey)
    }

    pub fn voq(&self, flowkey: u64) -> Option<&Voq> {
        self.voqs.get(&flowkey)
    }

    pub fn voq_count(&self) -> usize {
        self.voqs.len()
    }

    /// Total packets buffered across all VOQs.
    pub fn voq_volume(&self) -> usize {
        self.voqs.values().map(|v| v.len()).sum()
    }
}
