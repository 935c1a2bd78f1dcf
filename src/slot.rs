use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

use futures::channel::oneshot;
use log::{debug, info};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cell::{AnyCell, CellId, FunctionId, Restore};
use crate::engine::{Context, Engine};
use crate::runs::Run;
use crate::store::{CutoffFn, SharedBody};
use crate::Errors;

/// The cached node for one `(function, input)` call.
pub(crate) struct Slot<I, O> {
    id: CellId,
    function: FunctionId,
    name: Arc<str>,
    input: I,
    body: SharedBody<I, O>,
    cutoff: Option<Rc<CutoffFn<O>>>,
    state: Mutex<SlotState<O>>,
}

/// Everything about a slot that changes over time.
struct SlotState<O> {
    /// The run the `phase` below belongs to. Entering the slot in a newer
    /// run implicitly resets the phase to `Idle`.
    run: Option<Run>,
    phase: Phase<O>,
    memo: Option<Memo<O>>,
    /// Set by `reset`; sticky until the next successful compute.
    invalidated: bool,
}

enum Phase<O> {
    Idle,
    /// Phase-1 reentrancy guard: a restore that reaches this cell again
    /// through a stale dependency list fails instead of recursing forever.
    Restoring,
    /// Phase 1 failed this run; the next demand computes immediately. This
    /// also covers abandoned computes: a cell whose restore failed but which
    /// was never demanded re-runs its body when demanded later.
    RestoreFailed,
    InProgress {
        waiting: SmallVec<[oneshot::Sender<ReadOutcome<O>>; 2]>,
    },
}

struct Memo<O> {
    cached: Cached<O>,
    /// Last run in which this result was confirmed current.
    validated_at: Run,
    /// Last run in which the result differed from the previous one.
    changed_at: Run,
    /// Dependencies in the order the body demanded them, duplicates kept.
    deps: Vec<(CellId, Run)>,
}

enum Cached<O> {
    Value(O),
    Failed(Errors),
}

impl<O: Clone> Memo<O> {
    fn outcome(&self) -> ReadOutcome<O> {
        let result = match &self.cached {
            Cached::Value(v) => Ok(v.clone()),
            Cached::Failed(errors) => Err(errors.clone()),
        };
        ReadOutcome {
            result,
            changed_at: self.changed_at,
        }
    }
}

impl<O> Memo<O> {
    fn survives_run_boundary(&self) -> bool {
        match &self.cached {
            Cached::Value(_) => true,
            Cached::Failed(errors) => errors.iter().all(|e| e.is_reproducible()),
        }
    }
}

/// What a demand on a cell resolves to: the result plus the run in which the
/// cached output last changed (recorded on the consuming edge).
pub(crate) struct ReadOutcome<O> {
    pub(crate) result: Result<O, Errors>,
    pub(crate) changed_at: Run,
}

impl<O: Clone> Clone for ReadOutcome<O> {
    fn clone(&self) -> Self {
        ReadOutcome {
            result: self.result.clone(),
            changed_at: self.changed_at,
        }
    }
}

enum Decision<O> {
    Hit(ReadOutcome<O>),
    Wait(oneshot::Receiver<ReadOutcome<O>>),
    TryRestore,
    Compute,
}

impl<I, O> Slot<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    pub(crate) fn new(
        id: CellId,
        function: FunctionId,
        name: Arc<str>,
        input: I,
        body: SharedBody<I, O>,
        cutoff: Option<Rc<CutoffFn<O>>>,
    ) -> Self {
        Slot {
            id,
            function,
            name,
            input,
            body,
            cutoff,
            state: Mutex::new(SlotState {
                run: None,
                phase: Phase::Idle,
                memo: None,
                invalidated: false,
            }),
        }
    }

    pub(crate) fn input(&self) -> &I {
        &self.input
    }

    /// Returns the cached value if the slot currently holds one, without
    /// executing or validating anything.
    pub(crate) fn peek(&self) -> Option<O> {
        let guard = self.state.lock();
        match guard.memo.as_ref().map(|m| &m.cached) {
            Some(Cached::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The demand path: probe, then restore, then compute.
    pub(crate) async fn read(self: Arc<Self>, ctx: Context) -> ReadOutcome<O> {
        let engine = ctx.engine().clone();
        let run = engine.run_value();

        let decision = {
            let mut guard = self.state.lock();
            guard.normalize(run);
            let state = &mut *guard;
            match &mut state.phase {
                Phase::InProgress { waiting } => {
                    let (tx, rx) = oneshot::channel();
                    waiting.push(tx);
                    Decision::Wait(rx)
                }
                Phase::RestoreFailed => Decision::Compute,
                Phase::Idle | Phase::Restoring => match &state.memo {
                    Some(memo) if memo.validated_at == run => Decision::Hit(memo.outcome()),
                    _ => Decision::TryRestore,
                },
            }
        };

        match decision {
            Decision::Hit(outcome) => {
                info!("{:?}: returning result validated in {:?}", self, run);
                outcome
            }
            Decision::Wait(rx) => {
                debug!("{:?}: blocking on in-progress computation", self);
                rx.await
                    .expect("in-progress cell completed without notifying its waiters")
            }
            Decision::TryRestore => {
                if let Restore::Valid { .. } = AnyCell::restore(&*self, &engine, run) {
                    let guard = self.state.lock();
                    guard
                        .memo
                        .as_ref()
                        .expect("restored cell lost its memo")
                        .outcome()
                } else {
                    self.compute(ctx, run).await
                }
            }
            Decision::Compute => self.compute(ctx, run).await,
        }
    }

    /// Phase 2: run the body, record dependencies, apply the cutoff, cache.
    async fn compute(self: Arc<Self>, ctx: Context, run: Run) -> ReadOutcome<O> {
        let engine = ctx.engine().clone();
        {
            let mut guard = self.state.lock();
            guard.normalize(run);
            guard.phase = Phase::InProgress {
                waiting: SmallVec::new(),
            };
        }
        engine.counters().computed();
        info!("{:?}: executing body", self);

        let body = self.body.read().clone();
        let child = ctx.child_for(self.clone() as Arc<dyn AnyCell>);
        let result = match body {
            Some(body) => body(child.clone(), self.input.clone()).await,
            None => Err(Errors::raise(format!(
                "function `{}` has no body installed",
                self.name
            ))),
        };
        let deps = child.take_recorded_deps();

        let (outcome, waiting) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (cached, changed_at) = match result {
                Ok(value) => {
                    let changed_at = match (&self.cutoff, &state.memo) {
                        (Some(eq), Some(memo)) => match &memo.cached {
                            Cached::Value(old) if eq(old, &value) => {
                                debug!(
                                    "{:?}: output unchanged, keeping changed_at {:?}",
                                    self, memo.changed_at
                                );
                                memo.changed_at
                            }
                            _ => run,
                        },
                        _ => run,
                    };
                    (Cached::Value(value), changed_at)
                }
                Err(errors) => {
                    let errors = errors.stamped(self.id, child.call_stack());
                    (Cached::Failed(errors), run)
                }
            };
            state.memo = Some(Memo {
                cached,
                validated_at: run,
                changed_at,
                deps,
            });
            state.invalidated = false;
            let waiting = match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::InProgress { waiting } => waiting,
                _ => unreachable!("computing cell left the in-progress state"),
            };
            let outcome = state
                .memo
                .as_ref()
                .expect("freshly computed cell has a memo")
                .outcome();
            (outcome, waiting)
        };
        for waiter in waiting {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

impl<O> SlotState<O> {
    fn normalize(&mut self, run: Run) {
        if self.run != Some(run) {
            self.run = Some(run);
            self.phase = Phase::Idle;
        }
    }
}

impl<I, O> AnyCell for Slot<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    fn id(&self) -> CellId {
        self.id
    }

    fn function_id(&self) -> FunctionId {
        self.function
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn input_debug(&self) -> String {
        format!("{:?}", self.input)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore(&self, engine: &Engine, run: Run) -> Restore {
        let deps = {
            let mut guard = self.state.lock();
            guard.normalize(run);
            let state = &mut *guard;
            if let Some(memo) = &state.memo {
                if memo.validated_at == run {
                    return Restore::Valid {
                        changed_at: memo.changed_at,
                    };
                }
            }
            match state.phase {
                Phase::Idle => {}
                // Mid-restore (stale-graph loop), already failed this run,
                // or being computed by another task: nothing provable here.
                Phase::Restoring | Phase::RestoreFailed | Phase::InProgress { .. } => {
                    return Restore::Invalid;
                }
            }
            if state.invalidated {
                return Restore::Invalid;
            }
            let memo = match &state.memo {
                None => return Restore::Invalid,
                Some(memo) => memo,
            };
            if !memo.survives_run_boundary() {
                debug!("{:?}: non-reproducible failure expired", self);
                return Restore::Invalid;
            }
            engine.counters().restored();
            let deps = memo.deps.clone();
            state.phase = Phase::Restoring;
            deps
        };

        let mut valid = true;
        for (dep_id, recorded) in deps {
            engine.counters().edge_traversed();
            let dep_ok = match engine.cell(dep_id) {
                Some(dep) => matches!(
                    dep.restore(engine, run),
                    Restore::Valid { changed_at } if changed_at == recorded
                ),
                None => false,
            };
            if dep_ok {
                engine.confirm_edge(self.id, dep_id);
            } else {
                debug!("{:?}: dependency {:?} changed or went stale", self, dep_id);
                valid = false;
                break;
            }
        }

        let mut guard = self.state.lock();
        if valid {
            let memo = guard.memo.as_mut().expect("restoring cell lost its memo");
            memo.validated_at = run;
            let changed_at = memo.changed_at;
            guard.phase = Phase::Idle;
            info!("{:?}: validated cached result", self);
            Restore::Valid { changed_at }
        } else {
            guard.phase = Phase::RestoreFailed;
            Restore::Invalid
        }
    }

    fn mark_invalidated(&self) {
        let mut guard = self.state.lock();
        if guard.memo.is_some() {
            guard.invalidated = true;
        }
    }

    fn clear_memo(&self) {
        let mut guard = self.state.lock();
        guard.memo = None;
        guard.invalidated = false;
        guard.phase = Phase::Idle;
        guard.run = None;
    }

    fn has_completed(&self) -> bool {
        self.state.lock().memo.is_some()
    }

    fn recorded_deps(&self) -> Option<Vec<(CellId, Run)>> {
        self.state.lock().memo.as_ref().map(|m| m.deps.clone())
    }
}

impl<I, O> fmt::Debug for Slot<I, O>
where
    I: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}({:?})", self.name, self.input)
    }
}
