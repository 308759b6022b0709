//! CONGA: congestion-aware flowlet load balancing between leaf switches.
//!
//! Source ToRs keep a Discounting Rate Estimator per egress and a `to-leaf`
//! table of remote congestion metrics piggybacked by the destination ToR.
//! Path selection happens at flowlet granularity; every DATA packet carries
//! the chosen path, a running congestion extent maximized per hop, and one
//! randomly chosen feedback sample for the reverse direction.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::Config;
use crate::errors::{EmptyPathSetError, Error, MissingTagError, Result};
use crate::flowlet::FlowletTable;
use crate::packet::{Packet, PROT_UDP};
use crate::path::{self, PathId};
use crate::sim::{EventQueue, Nanos, Timer};
use crate::switch::Step;
use crate::wire::conga::{self, CONGA_NULL};
use crate::wire::Tag;

/// How many paths GET-BEST-PATH samples per decision.
const N_SAMPLE: usize = 4;

#[derive(Clone, Copy, Debug)]
struct FeedbackInfo {
    ce: u32,
    updated: Nanos,
}

#[derive(Clone, Copy, Debug)]
struct OutpathInfo {
    ce: u32,
    updated: Nanos,
}

pub struct CongaRouting {
    switch_id: u32,
    is_tor: bool,

    dre_time: Nanos,
    aging_time: Nanos,
    flowlet_timeout: Nanos,
    quantize_bits: u32,
    alpha: f64,

    /// dstToR -> enumerated paths. Static after construction.
    routing: HashMap<u32, BTreeSet<PathId>>,
    /// outPort -> link bit-rate. Static after construction.
    link_rate: HashMap<u32, u64>,

    /// srcToR -> path -> congestion observed on packets arriving here.
    from_leaf: HashMap<u32, HashMap<PathId, FeedbackInfo>>,
    /// dstToR -> path -> congestion the remote ToR piggybacked back to us.
    to_leaf: HashMap<u32, HashMap<PathId, OutpathInfo>>,
    /// outPort -> accumulated bytes, decayed on the DRE tick.
    dre: HashMap<u32, u64>,

    flowlets: FlowletTable,
    rng: StdRng,
    timers_armed: bool,

    pub(crate) n_flowlet_timeout: u64,
}

impl CongaRouting {
    pub fn new(
        switch_id: u32,
        is_tor: bool,
        cfg: &Config,
        routing: HashMap<u32, BTreeSet<PathId>>,
        link_rate: HashMap<u32, u64>,
        rng_seed: u64,
    ) -> CongaRouting {
        CongaRouting {
            switch_id,
            is_tor,
            dre_time: cfg.dre_time,
            aging_time: cfg.aging_time,
            flowlet_timeout: cfg.flowlet_timeout,
            quantize_bits: cfg.quantize_bits,
            alpha: cfg.alpha,
            routing,
            link_rate,
            from_leaf: HashMap::new(),
            to_leaf: HashMap::new(),
            dre: HashMap::new(),
            flowlets: FlowletTable::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            timers_armed: false,
            n_flowlet_timeout: 0,
        }
    }

    /// Every CONGA-mode packet at this switch is hijacked to here.
    pub fn route_input(
        &mut self,
        mut pkt: Packet,
        src_tor: u32,
        dst_tor: u32,
        q: &mut EventQueue,
    ) -> Result<Vec<Step>> {
        let now = q.now();

        // control packets are prioritized and ride flow-ECMP
        if pkt.l3_prot != PROT_UDP {
            return Ok(vec![Step::Deliver { pkt }]);
        }

        if !self.timers_armed {
            debug!(switch = self.switch_id, "starting conga dre/aging events");
            q.schedule_in(self.dre_time, self.switch_id, Timer::CongaDre);
            q.schedule_in(self.aging_time, self.switch_id, Timer::CongaAging);
            self.timers_armed = true;
        }

        // intra-pod traffic has only one path
        if src_tor == dst_tor {
            return Ok(vec![Step::Deliver { pkt }]);
        }

        let tag = match pkt.tag.take() {
            Some(Tag::Conga(t)) => Some(t),
            Some(other) => {
                return Err(Error(format!(
                    "conga switch {} saw a foreign tag {:?}",
                    self.switch_id, other
                )));
            }
            None => None,
        };

        if self.is_tor {
            if let Some(t) = tag {
                self.recv_at_dest_tor(t, src_tor, now);
                // tag stripped; pass to the end-host interface
                return Ok(vec![Step::Deliver { pkt }]);
            }
            return self.send_at_source_tor(pkt, dst_tor, now);
        }

        // agg/core switch
        let mut t = tag.ok_or(MissingTagError)?;
        t.hop += 1;
        let out_port = path::port_of(t.path, t.hop);
        let x = self.update_dre(out_port, pkt.size as u64);
        let local_ce = self.quantize(out_port, x)?;
        t.ce = t.ce.max(local_ce);
        debug!(
            switch = self.switch_id,
            path = t.path,
            ce = t.ce,
            out_port,
            "conga transit"
        );
        pkt.tag = Some(Tag::Conga(t));
        Ok(vec![Step::Forward { pkt, port: out_port }])
    }

    fn send_at_source_tor(
        &mut self,
        mut pkt: Packet,
        dst_tor: u32,
        now: Nanos,
    ) -> Result<Vec<Step>> {
        // piggyback one uniformly random from-leaf observation, or a sentinel
        let (fb_path, fb_metric) = match self.from_leaf.get(&dst_tor) {
            Some(m) if !m.is_empty() => {
                let i = self.rng.gen_range(0..m.len());
                let (p, info) = m.iter().nth(i).expect("nonempty");
                (*p, info.ce)
            }
            _ => (CONGA_NULL, CONGA_NULL),
        };

        let key = path::flowlet_key(pkt.dip, pkt.sport, pkt.dport, pkt.pg);
        let cached = match self.flowlets.get_mut(key) {
            Some(f) if now - f.active <= self.flowlet_timeout => {
                f.touch(now);
                Some(f.path)
            }
            Some(_) => {
                self.n_flowlet_timeout += 1;
                None
            }
            None => None,
        };
        let selected = match cached {
            Some(p) => p,
            None => {
                let best = self.best_path(dst_tor, N_SAMPLE)?;
                self.flowlets.set_path(key, best, now);
                best
            }
        };

        let out_port = path::port_of(selected, 0);
        let x = self.update_dre(out_port, pkt.size as u64);
        let local_ce = self.quantize(out_port, x)?;
        debug!(
            switch = self.switch_id,
            path = selected,
            ce = local_ce,
            out_port,
            fb_path,
            fb_metric,
            "conga source tor"
        );
        pkt.tag = Some(Tag::Conga(conga::Tag {
            path: selected,
            ce: local_ce,
            hop: 0,
            fb_path,
            fb_metric,
        }));
        Ok(vec![Step::Forward { pkt, port: out_port }])
    }

    fn recv_at_dest_tor(&mut self, t: conga::Tag, src_tor: u32, now: Nanos) {
        if let Some((p, metric)) = t.feedback() {
            self.to_leaf
                .entry(src_tor)
                .or_default()
                .insert(p, OutpathInfo { ce: metric, updated: now });
        }
        self.from_leaf
            .entry(src_tor)
            .or_default()
            .insert(t.path, FeedbackInfo { ce: t.ce, updated: now });
        debug!(
            switch = self.switch_id,
            path = t.path,
            ce = t.ce,
            "conga destination tor"
        );
    }

    /// GET-BEST-PATH: sample up to `n_sample` paths toward `dst_tor` and
    /// return a uniformly random member of the least-congested set, where a
    /// path's congestion is the max of the local DRE at its first hop and
    /// the remote metric from the to-leaf table.
    fn best_path(&mut self, dst_tor: u32, n_sample: usize) -> Result<PathId> {
        let paths = match self.routing.get(&dst_tor) {
            Some(s) if !s.is_empty() => s,
            _ => return Err(EmptyPathSetError(dst_tor).into()),
        };
        let n = n_sample.min(paths.len());
        let start = self.rng.gen_range(0..=(paths.len() - n));

        let to_leaf = self.to_leaf.get(&dst_tor);
        let mut candidates: Vec<PathId> = Vec::with_capacity(n);
        let mut min_congestion = u32::MAX;
        for &p in paths.iter().skip(start).take(n) {
            let out_port = path::port_of(p, 0);
            let local = self.quantize(out_port, self.dre.get(&out_port).copied().unwrap_or(0))?;
            let remote = to_leaf
                .and_then(|m| m.get(&p))
                .map(|i| i.ce)
                .unwrap_or(0);
            let congestion = local.max(remote);
            if congestion < min_congestion {
                min_congestion = congestion;
                candidates.clear();
                candidates.push(p);
            } else if congestion == min_congestion {
                candidates.push(p);
            }
        }
        Ok(candidates[self.rng.gen_range(0..candidates.len())])
    }

    fn update_dre(&mut self, out_port: u32, bytes: u64) -> u64 {
        let x = self.dre.entry(out_port).or_insert(0);
        *x += bytes;
        *x
    }

    /// Quantize a DRE reading into a `quantize_bits`-wide congestion extent.
    fn quantize(&self, out_port: u32, x: u64) -> Result<u32> {
        let bit_rate = self
            .link_rate
            .get(&out_port)
            .copied()
            .ok_or_else(|| Error(format!("no link rate for egress {}", out_port)))?;
        let dre_secs = self.dre_time as f64 / 1e9;
        let ratio = (x as f64 * 8.0) / (bit_rate as f64 * dre_secs / self.alpha);
        Ok((ratio * f64::from(1u32 << self.quantize_bits)) as u32)
    }

    /// DRE tick: exponential decay of every egress counter.
    pub fn on_dre_tick(&mut self, q: &mut EventQueue) {
        for x in self.dre.values_mut() {
            *x = (*x as f64 * (1.0 - self.alpha)) as u64;
        }
        q.schedule_in(self.dre_time, self.switch_id, Timer::CongaDre);
    }

    /// Aging sweep: stale to-leaf metrics decay to 0, stale from-leaf and
    /// flowlet entries are deleted.
    pub fn on_aging(&mut self, q: &mut EventQueue) {
        let now = q.now();
        let aging = self.aging_time;
        for inner in self.to_leaf.values_mut() {
            for info in inner.values_mut() {
                if now - info.updated > aging {
                    info.ce = 0;
                }
            }
        }
        for inner in self.from_leaf.values_mut() {
            inner.retain(|_, info| now - info.updated <= aging);
        }
        self.flowlets.sweep(now, aging);
        q.schedule_in(aging, self.switch_id, Timer::CongaAging);
    }

    pub fn flowlets(&self) -> &FlowletTable {
        &self.flowlets
    }

    /// Congestion last observed on packets arriving from `src_tor` via `p`.
    pub fn from_leaf_metric(&self, src_tor: u32, p: PathId) -> Option<u32> {
        self.from_leaf.get(&src_tor)?.get(&p).map(|i| i.ce)
    }

    /// Congestion last piggybacked back by `dst_tor` for outbound path `p`.
    pub fn to_leaf_metric(&self, dst_tor: u32, p: PathId) -> Option<u32> {
        self.to_leaf.get(&dst_tor)?.get(&p).map(|i| i.ce)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::Packet;
    use crate::sim::EventQueue;

    fn conga_tor(paths: &[PathId]) -> CongaRouting {
        let mut routing = HashMap::new();
        routing.insert(2u32, paths.iter().copied().collect::<BTreeSet<_>>());
        let mut link_rate = HashMap::new();
        for &p in paths {
            link_rate.insert(path::port_of(p, 0), 100_000_000_000u64);
        }
        CongaRouting::new(1, true, &Config::default(), routing, link_rate, 42)
    }

    #[test]
    fn best_path_prefers_least_remote_congestion() {
        // paths A, B, C with to-leaf metrics 4, 0, 2 and all DREs at zero
        let (a, b, c) = (0x01, 0x02, 0x03);
        let mut conga = conga_tor(&[a, b, c]);
        conga.to_leaf.entry(2).or_default().insert(a, OutpathInfo { ce: 4, updated: 0 });
        conga.to_leaf.entry(2).or_default().insert(b, OutpathInfo { ce: 0, updated: 0 });
        conga.to_leaf.entry(2).or_default().insert(c, OutpathInfo { ce: 2, updated: 0 });

        for _ in 0..16 {
            assert_eq!(conga.best_path(2, 3).unwrap(), b);
        }
    }

    #[test]
    fn flowlet_reuses_path_within_timeout() {
        let mut conga = conga_tor(&[0x01, 0x02, 0x03, 0x04]);
        let mut q = EventQueue::new();

        let pkt = || Packet::data(0x0b00_0101, 0x0b00_0201, 10000, 100, 3, 1000);
        let first = conga.route_input(pkt(), 1, 2, &mut q).unwrap();
        let first_port = match &first[..] {
            [Step::Forward { port, .. }] => *port,
            other => panic!("expected one forward, got {:?}", other),
        };

        // every packet inside the flowlet gap goes out the same port
        for i in 1..10u64 {
            q.advance_to(i * 10_000);
            let steps = conga.route_input(pkt(), 1, 2, &mut q).unwrap();
            match &steps[..] {
                [Step::Forward { port, .. }] => assert_eq!(*port, first_port),
                other => panic!("expected one forward, got {:?}", other),
            }
        }
        assert_eq!(conga.n_flowlet_timeout, 0);
    }

    #[test]
    fn dre_decays_on_tick() {
        let mut conga = conga_tor(&[0x01]);
        let mut q = EventQueue::new();
        conga.update_dre(1, 10_000);
        conga.on_dre_tick(&mut q);
        assert_eq!(conga.dre[&1], 8_000);
        conga.on_dre_tick(&mut q);
        assert_eq!(conga.dre[&1], 6_400);
    }

    #[test]
    fn aging_zeroes_to_leaf_and_drops_from_leaf() {
        let mut conga = conga_tor(&[0x01]);
        let mut q = EventQueue::new();
        conga.to_leaf.entry(2).or_default().insert(0x01, OutpathInfo { ce: 5, updated: 0 });
        conga.from_leaf.entry(2).or_default().insert(0x01, FeedbackInfo { ce: 5, updated: 0 });

        q.advance_to(conga.aging_time + 1);
        conga.on_aging(&mut q);
        assert_eq!(conga.to_leaf[&2][&0x01].ce, 0);
        assert!(conga.from_leaf[&2].is_empty());
    }
}
