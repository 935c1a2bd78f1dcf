use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures::executor::LocalPool;
use futures::future::FutureExt;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::cell::{AnyCell, CellId, FunctionId};
use crate::dag::{AddEdge, Dag};
use crate::function::{Cell, Function, FunctionBuilder};
use crate::invalidation::{Invalidation, Kind};
use crate::perf::PerfCounters;
use crate::runs::Run;
use crate::slot::Slot;
use crate::stack::{Frame, FrameNode};
use crate::store::{Store, StoreOps};
use crate::task::Task;
use crate::{CycleError, Errors, MemoError};

/// The engine: the cell stores, the run counter, the cycle-detection DAG,
/// and the perf counters, behind one cheaply clonable handle.
///
/// All state is engine-local; independent engines share nothing.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    state: Mutex<EngineState>,
    cells: Mutex<FxHashMap<CellId, Arc<dyn AnyCell>>>,
    stores: Mutex<FxHashMap<FunctionId, Arc<dyn StoreOps>>>,
    dag: Mutex<Dag>,
    counters: PerfCounters,
    next_cell: AtomicU64,
    next_function: AtomicU32,
    run_fn: RwLock<Option<Function<(), Run>>>,
}

struct EngineState {
    run: Run,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    /// Creates a fresh engine with an empty cache and the run counter at 1.
    pub fn new() -> Engine {
        let engine = Engine {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState { run: Run::start() }),
                cells: Mutex::new(FxHashMap::default()),
                stores: Mutex::new(FxHashMap::default()),
                dag: Mutex::new(Dag::default()),
                counters: PerfCounters::default(),
                next_cell: AtomicU64::new(0),
                next_function: AtomicU32::new(0),
                run_fn: RwLock::new(None),
            }),
        };
        // The run counter is itself a dependency: cells that consume it are
        // re-validated every run, and cutoff decides whether their
        // dependents notice.
        let run_fn = engine
            .function::<(), Run>("current-run")
            .build(|ctx, ()| {
                let engine = ctx.engine().clone();
                async move { Ok(engine.run_value()) }.boxed_local()
            });
        *engine.inner.run_fn.write() = Some(run_fn);
        engine
    }

    /// Starts building a function registration.
    pub fn function<I, O>(&self, name: impl Into<String>) -> FunctionBuilder<I, O> {
        FunctionBuilder {
            engine: self.clone(),
            name: name.into(),
            cutoff: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Drives a task to completion on the single-threaded scheduler.
    pub fn run<T, Fut>(&self, f: impl FnOnce(Context) -> Fut) -> Result<T, Errors>
    where
        T: 'static,
        Fut: Future<Output = Result<T, Errors>> + 'static,
    {
        let ctx = Context {
            engine: self.clone(),
            frame: None,
            deps: None,
        };
        let mut pool = LocalPool::new();
        pool.run_until(f(ctx))
    }

    /// Advances the run counter and applies `invalidation`.
    ///
    /// The cycle-detection DAG and the perf counters are reset here as well:
    /// both describe a single run.
    pub fn reset(&self, invalidation: Invalidation) {
        let next = {
            let mut state = self.inner.state.lock();
            state.run = state.run.next();
            state.run
        };
        info!("reset: advancing to {:?} with {:?}", next, invalidation);
        self.apply(&invalidation);
        if let Some(run_fn) = self.inner.run_fn.read().clone() {
            self.apply(&Invalidation::function(run_fn.id()));
        }
        self.inner.dag.lock().clear();
        self.inner.counters.reset();
    }

    fn apply(&self, invalidation: &Invalidation) {
        match invalidation.kind() {
            Kind::Empty => {}
            Kind::Cell(id) => {
                if let Some(cell) = self.cell(*id) {
                    debug!("invalidating {}({})", cell.name(), cell.input_debug());
                    cell.mark_invalidated();
                }
            }
            Kind::Function(id) => {
                if let Some(store) = self.inner.stores.lock().get(id).cloned() {
                    debug!("invalidating every cell of `{}`", store.name());
                    store.invalidate_all();
                }
            }
            Kind::ClearCaches => {
                debug!("clearing all caches");
                let stores: Vec<_> = self.inner.stores.lock().values().cloned().collect();
                for store in stores {
                    store.clear_memos();
                }
                self.inner.dag.lock().clear();
            }
            Kind::Many(parts) => {
                for part in parts {
                    self.apply(part);
                }
            }
        }
    }

    /// The function backing [`Context::current_run`].
    pub fn current_run_function(&self) -> Function<(), Run> {
        self.inner
            .run_fn
            .read()
            .clone()
            .expect("engine bootstrap incomplete")
    }

    /// The existing cell for `(f, input)`, without creating one: `Some`
    /// only if the call has ever completed.
    pub fn previously_evaluated_cell<I, O>(
        &self,
        f: &Function<I, O>,
        input: &I,
    ) -> Option<Cell<I, O>>
    where
        I: Clone + fmt::Debug + Eq + Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        let slot = f.lookup(input)?;
        if AnyCell::has_completed(&*slot) {
            Some(Cell {
                slot,
                engine: self.clone(),
            })
        } else {
            None
        }
    }

    /// The dependencies recorded by the last compute of `(f, input)`, in
    /// recording order, or `None` if the call never completed.
    pub fn get_deps<I, O>(&self, f: &Function<I, O>, input: &I) -> Option<Vec<Frame>>
    where
        I: Clone + fmt::Debug + Eq + Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        let slot = f.lookup(input)?;
        let deps = AnyCell::recorded_deps(&*slot)?;
        Some(
            deps.into_iter()
                .filter_map(|(id, _)| self.cell(id))
                .map(|cell| Frame { cell })
                .collect(),
        )
    }

    /// Number of interned cells.
    pub fn len(&self) -> usize {
        self.inner.cells.lock().len()
    }

    /// True if no cell was ever interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The engine's perf counters.
    pub fn perf_counters(&self) -> &PerfCounters {
        &self.inner.counters
    }

    pub(crate) fn counters(&self) -> &PerfCounters {
        &self.inner.counters
    }

    pub(crate) fn run_value(&self) -> Run {
        self.inner.state.lock().run
    }

    pub(crate) fn allocate_cell_id(&self) -> CellId {
        CellId(self.inner.next_cell.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register_cell(&self, cell: Arc<dyn AnyCell>) {
        self.inner.cells.lock().insert(cell.id(), cell);
    }

    pub(crate) fn cell(&self, id: CellId) -> Option<Arc<dyn AnyCell>> {
        self.inner.cells.lock().get(&id).cloned()
    }

    pub(crate) fn register_store<S>(&self, make: impl FnOnce(FunctionId) -> S) -> FunctionId
    where
        S: StoreOps + 'static,
    {
        let id = FunctionId(self.inner.next_function.fetch_add(1, Ordering::SeqCst));
        let store = Arc::new(make(id));
        self.inner.stores.lock().insert(id, store);
        id
    }

    pub(crate) fn with_store<I, O, R>(
        &self,
        id: FunctionId,
        f: impl FnOnce(&Store<I, O>) -> R,
    ) -> R
    where
        I: Clone + fmt::Debug + Eq + Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        let store = self
            .inner
            .stores
            .lock()
            .get(&id)
            .cloned()
            .expect("unknown function id");
        let store = store
            .as_any()
            .downcast_ref::<Store<I, O>>()
            .expect("function id registered with different input/output types");
        f(store)
    }

    /// Records the pending edge `caller -> callee` into the cycle-detection
    /// DAG before the callee is demanded. Fails with a cycle error when the
    /// edge closes a path `callee -> ... -> caller`.
    pub(crate) fn pending_edge(
        &self,
        caller: Option<CellId>,
        callee: CellId,
    ) -> Result<(), Errors> {
        let path = {
            let mut dag = self.inner.dag.lock();
            if dag.ensure_node(callee) {
                self.inner.counters.dag_node();
            }
            let caller = match caller {
                None => return Ok(()),
                Some(caller) => caller,
            };
            if dag.ensure_node(caller) {
                self.inner.counters.dag_node();
            }
            self.inner.counters.edge_traversed();
            self.inner.counters.dag_attempt();
            match dag.add_edge(caller, callee) {
                AddEdge::Added => {
                    self.inner.counters.dag_edge();
                    return Ok(());
                }
                AddEdge::Exists => return Ok(()),
                AddEdge::Cycle(path) => {
                    self.inner.counters.dag_path();
                    path
                }
            }
        };
        debug!("cycle detected while demanding {:?}", callee);
        Err(self.cycle_error(path))
    }

    /// Re-adds an edge that phase 1 confirmed still valid. Confirmed edges
    /// connect settled cells and can never close a cycle.
    pub(crate) fn confirm_edge(&self, from: CellId, to: CellId) {
        let mut dag = self.inner.dag.lock();
        if dag.ensure_node(from) {
            self.inner.counters.dag_node();
        }
        if dag.ensure_node(to) {
            self.inner.counters.dag_node();
        }
        self.inner.counters.dag_attempt();
        match dag.add_edge(from, to) {
            AddEdge::Added => self.inner.counters.dag_edge(),
            AddEdge::Exists => {}
            AddEdge::Cycle(_) => {
                unreachable!("a restore-confirmed edge closed a cycle")
            }
        }
    }

    fn cycle_error(&self, path: Vec<CellId>) -> Errors {
        // The detector hands back `callee -> ... -> caller`; the reported
        // path lists the frames caller-first, matching the call stack.
        let origin = path.first().copied();
        let frames: Vec<Frame> = path
            .into_iter()
            .rev()
            .filter_map(|id| self.cell(id))
            .map(|cell| Frame { cell })
            .collect();
        Errors::of(MemoError::from_cycle(CycleError::new(frames), origin))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Engine")
            .field("run", &self.run_value())
            .field("cells", &self.len())
            .finish()
    }
}

/// The ambient state of a running task: the engine, the active call stack,
/// and the dependency recorder of the innermost computing cell.
///
/// A `Context` is handed to every body; forked children share the parent
/// chain without observing each other's frames.
#[derive(Clone)]
pub struct Context {
    engine: Engine,
    frame: Option<Arc<FrameNode>>,
    deps: Option<Arc<Mutex<Vec<(CellId, Run)>>>>,
}

impl Context {
    /// The engine this context belongs to.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Demands `f(input)`, memoized: restores the cached result if it can be
    /// proven current, computes it otherwise, and records the dependency
    /// edge for the calling cell.
    pub fn exec<I, O>(&self, f: &Function<I, O>, input: I) -> Task<O>
    where
        I: Clone + fmt::Debug + Eq + Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        let ctx = self.clone();
        let f = f.clone();
        async move {
            let slot = f.intern(input);
            ctx.demand(slot).await
        }
        .boxed_local()
    }

    /// The active run. This records a dependency on the run counter, so the
    /// calling cell re-validates at every run boundary.
    pub fn current_run(&self) -> Task<Run> {
        self.exec(&self.engine.current_run_function(), ())
    }

    /// The active call stack, innermost frame first.
    pub fn call_stack(&self) -> Vec<Frame> {
        FrameNode::unwind(&self.frame)
    }

    pub(crate) async fn demand<I, O>(&self, slot: Arc<Slot<I, O>>) -> Result<O, Errors>
    where
        I: Clone + fmt::Debug + Eq + Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        let callee = AnyCell::id(&*slot);
        self.engine
            .pending_edge(self.frame.as_ref().map(|f| f.cell.id()), callee)?;
        let outcome = slot.read(self.clone()).await;
        self.record_dep(callee, outcome.changed_at);
        outcome.result
    }

    pub(crate) fn child_for(&self, cell: Arc<dyn AnyCell>) -> Context {
        Context {
            engine: self.engine.clone(),
            frame: Some(Arc::new(FrameNode {
                cell,
                parent: self.frame.clone(),
            })),
            deps: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub(crate) fn take_recorded_deps(&self) -> Vec<(CellId, Run)> {
        match &self.deps {
            Some(deps) => std::mem::take(&mut *deps.lock()),
            None => Vec::new(),
        }
    }

    fn record_dep(&self, id: CellId, changed_at: Run) {
        if let Some(deps) = &self.deps {
            deps.lock().push((id, changed_at));
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Context")
            .field("engine", &self.engine)
            .field("stack", &self.call_stack())
            .finish()
    }
}
