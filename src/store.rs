use std::any::Any;
use std::fmt;
use std::hash::{BuildHasherDefault, Hash};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;

use crate::cell::{AnyCell, FunctionId};
use crate::engine::{Context, Engine};
use crate::slot::Slot;
use crate::task::Task;

pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

pub(crate) type BodyFn<I, O> = dyn Fn(Context, I) -> Task<O>;

/// The body slot is shared between the store and every interned cell, so a
/// body installed after `declare` is visible to cells interned before it.
pub(crate) type SharedBody<I, O> = Rc<RwLock<Option<Rc<BodyFn<I, O>>>>>;

pub(crate) type CutoffFn<O> = dyn Fn(&O, &O) -> bool;

/// Per-function storage: the interning map from input to its unique cell.
pub(crate) struct Store<I, O> {
    function: FunctionId,
    name: Arc<str>,
    body: SharedBody<I, O>,
    cutoff: Option<Rc<CutoffFn<O>>>,
    cells: Mutex<FxIndexMap<I, Arc<Slot<I, O>>>>,
}

impl<I, O> Store<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    pub(crate) fn new(
        function: FunctionId,
        name: Arc<str>,
        cutoff: Option<Rc<CutoffFn<O>>>,
    ) -> Self {
        Store {
            function,
            name,
            body: Rc::new(RwLock::new(None)),
            cutoff,
            cells: Mutex::new(FxIndexMap::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn install_body(&self, body: Rc<BodyFn<I, O>>) {
        let mut slot = self.body.write();
        if slot.is_some() {
            panic!("function `{}` already has a body installed", self.name);
        }
        *slot = Some(body);
    }

    /// Intern: create the cell for `input` if absent, return it otherwise.
    pub(crate) fn intern(&self, engine: &Engine, input: I) -> Arc<Slot<I, O>> {
        let mut cells = self.cells.lock();
        if let Some(slot) = cells.get(&input) {
            return slot.clone();
        }
        let id = engine.allocate_cell_id();
        let slot = Arc::new(Slot::new(
            id,
            self.function,
            self.name.clone(),
            input.clone(),
            self.body.clone(),
            self.cutoff.clone(),
        ));
        engine.register_cell(slot.clone());
        cells.insert(input, slot.clone());
        slot
    }

    /// Lookup without creating.
    pub(crate) fn lookup(&self, input: &I) -> Option<Arc<Slot<I, O>>> {
        self.cells.lock().get(input).cloned()
    }
}

/// Type-erased store operations, used by invalidation flushing.
pub(crate) trait StoreOps {
    fn as_any(&self) -> &dyn Any;

    fn name(&self) -> &str;

    /// Marks every cell of the function as out of date.
    fn invalidate_all(&self);

    /// Drops every cell's cached result (`clear_caches`).
    fn clear_memos(&self);
}

impl<I, O> StoreOps for Store<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn invalidate_all(&self) {
        for slot in self.cells.lock().values() {
            slot.as_ref().mark_invalidated();
        }
    }

    fn clear_memos(&self) {
        for slot in self.cells.lock().values() {
            slot.as_ref().clear_memo();
        }
    }
}
