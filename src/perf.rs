use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters describing the work done by the current run.
///
/// Collection is off by default; call [`PerfCounters::enable`] first. The
/// counters reset at every run boundary and on [`PerfCounters::reset`].
pub struct PerfCounters {
    enabled: AtomicBool,
    nodes_restored: AtomicU64,
    nodes_computed: AtomicU64,
    edges_traversed: AtomicU64,
    nodes_touched: AtomicU64,
    dag_nodes: AtomicU64,
    dag_edges: AtomicU64,
    dag_paths: AtomicU64,
    dag_attempts: AtomicU64,
}

impl Default for PerfCounters {
    fn default() -> Self {
        PerfCounters {
            enabled: AtomicBool::new(false),
            nodes_restored: AtomicU64::new(0),
            nodes_computed: AtomicU64::new(0),
            edges_traversed: AtomicU64::new(0),
            nodes_touched: AtomicU64::new(0),
            dag_nodes: AtomicU64::new(0),
            dag_edges: AtomicU64::new(0),
            dag_paths: AtomicU64::new(0),
            dag_attempts: AtomicU64::new(0),
        }
    }
}

impl PerfCounters {
    /// Turns collection on.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.nodes_restored.store(0, Ordering::SeqCst);
        self.nodes_computed.store(0, Ordering::SeqCst);
        self.edges_traversed.store(0, Ordering::SeqCst);
        self.nodes_touched.store(0, Ordering::SeqCst);
        self.dag_nodes.store(0, Ordering::SeqCst);
        self.dag_edges.store(0, Ordering::SeqCst);
        self.dag_paths.store(0, Ordering::SeqCst);
        self.dag_attempts.store(0, Ordering::SeqCst);
    }

    /// A snapshot of the counters accumulated since the last reset.
    pub fn report_for_current_run(&self) -> PerfReport {
        PerfReport {
            nodes_restored: self.nodes_restored.load(Ordering::SeqCst),
            nodes_computed: self.nodes_computed.load(Ordering::SeqCst),
            edges_traversed: self.edges_traversed.load(Ordering::SeqCst),
            dag_nodes: self.dag_nodes.load(Ordering::SeqCst),
            dag_edges: self.dag_edges.load(Ordering::SeqCst),
            dag_paths: self.dag_paths.load(Ordering::SeqCst),
        }
    }

    /// Checks the internal accounting identities; panics on violation.
    pub fn assert_invariants(&self) {
        let restored = self.nodes_restored.load(Ordering::SeqCst);
        let computed = self.nodes_computed.load(Ordering::SeqCst);
        let touched = self.nodes_touched.load(Ordering::SeqCst);
        assert_eq!(
            restored + computed,
            touched,
            "every touched node must be accounted restored or computed"
        );
        let edges = self.dag_edges.load(Ordering::SeqCst);
        let paths = self.dag_paths.load(Ordering::SeqCst);
        let attempts = self.dag_attempts.load(Ordering::SeqCst);
        assert!(
            edges + paths <= attempts,
            "cycle-detection additions ({}) and paths ({}) exceed attempts ({})",
            edges,
            paths,
            attempts
        );
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn restored(&self) {
        self.bump(&self.nodes_restored);
        self.bump(&self.nodes_touched);
    }

    pub(crate) fn computed(&self) {
        self.bump(&self.nodes_computed);
        self.bump(&self.nodes_touched);
    }

    pub(crate) fn edge_traversed(&self) {
        self.bump(&self.edges_traversed);
    }

    pub(crate) fn dag_node(&self) {
        self.bump(&self.dag_nodes);
    }

    pub(crate) fn dag_edge(&self) {
        self.bump(&self.dag_edges);
    }

    pub(crate) fn dag_path(&self) {
        self.bump(&self.dag_paths);
    }

    pub(crate) fn dag_attempt(&self) {
        self.bump(&self.dag_attempts);
    }
}

/// A point-in-time snapshot of [`PerfCounters`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerfReport {
    /// Cells that entered phase 1 with an intact prior result.
    pub nodes_restored: u64,
    /// Body executions (phase 2 entries).
    pub nodes_computed: u64,
    /// Restore dependency checks plus compute dependency records.
    pub edges_traversed: u64,
    /// Nodes added to the cycle-detection DAG this run.
    pub dag_nodes: u64,
    /// Edges added to the cycle-detection DAG this run.
    pub dag_edges: u64,
    /// Cycle paths reported this run.
    pub dag_paths: u64,
}

impl fmt::Display for PerfReport {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "restored: {}, computed: {}, traversed: {}, dag: {} nodes / {} edges / {} paths",
            self.nodes_restored,
            self.nodes_computed,
            self.edges_traversed,
            self.dag_nodes,
            self.dag_edges,
            self.dag_paths
        )
    }
}
