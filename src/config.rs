//! Design-time tunables for the load-balancing engines.

use crate::sim::Nanos;

/// Which engine a switch runs. Discriminants follow the simulator's
/// configuration convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LbMode {
    FlowEcmp = 0,
    Drill = 2,
    Conga = 3,
    Letflow = 6,
    Conweave = 9,
}

/// Parameter surface shared by all engines. Every field is tunable; the
/// defaults are the production values.
#[derive(Clone, Debug)]
pub struct Config {
    /// Gap that re-opens path selection for CONGA/LETFLOW.
    pub flowlet_timeout: Nanos,
    /// CONGA: period of the DRE decay tick.
    pub dre_time: Nanos,
    /// Period of the table-aging sweep (CONGA leaf tables, flowlet tables,
    /// CONWEAVE per-flow tables).
    pub aging_time: Nanos,
    /// CONGA: width of the quantized congestion extent, in bits.
    pub quantize_bits: u32,
    /// CONGA: DRE decay factor.
    pub alpha: f64,
    /// CONWEAVE: added to baseRTT to form the REPLY deadline.
    pub extra_reply_deadline: Nanos,
    /// CONWEAVE: padding on the expected VOQ flush deadline, for jitter.
    pub extra_voq_flush_time: Nanos,
    /// CONWEAVE: source-ToR flowlet-style expiry that opens a new epoch.
    pub tx_expiry_time: Nanos,
    /// CONWEAVE: fallback flush gap when phase-0 timing is unavailable.
    pub default_voq_wait: Nanos,
    /// CONWEAVE: how long a NOTIFY blacklists a path.
    pub path_pause_time: Nanos,
    /// CONWEAVE: enables NOTIFY generation and blacklist consultation.
    pub path_aware_rerouting: bool,
    /// CONWEAVE: number of slots in the direct-mapped path blacklist.
    pub path_table_size: usize,
    /// DRILL: how many egress candidates to sample per packet.
    pub drill_sample: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flowlet_timeout: 100_000,
            dre_time: 50_000,
            aging_time: 2_000_000,
            quantize_bits: 3,
            alpha: 0.2,
            extra_reply_deadline: 4_000,
            extra_voq_flush_time: 32_000,
            tx_expiry_time: 1_000_000,
            default_voq_wait: 500_000,
            path_pause_time: 8_000,
            path_aware_rerouting: true,
            path_table_size: 65536,
            drill_sample: 2,
        }
    }
}
