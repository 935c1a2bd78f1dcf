use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::FutureExt;

use crate::cell::{AnyCell, CellId, FunctionId};
use crate::engine::{Context, Engine};
use crate::invalidation::Invalidation;
use crate::slot::Slot;
use crate::store::{CutoffFn, Store};
use crate::task::Task;

/// A registered memoized function: a name, an input type, a body, and an
/// optional output-equality cutoff.
///
/// Handles are cheap to clone. A function is created through
/// [`Engine::function`]; a self-referential body is registered in two steps
/// by calling [`FunctionBuilder::declare`] first and [`Function::define`]
/// once the handle has been captured.
pub struct Function<I, O> {
    engine: Engine,
    id: FunctionId,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Function<I, O> {
    fn clone(&self) -> Self {
        Function {
            engine: self.engine.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<I, O> Function<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    pub(crate) fn from_parts(engine: Engine, id: FunctionId) -> Self {
        Function {
            engine,
            id,
            _marker: PhantomData,
        }
    }

    pub(crate) fn id(&self) -> FunctionId {
        self.id
    }

    /// The name the function was registered under.
    pub fn name(&self) -> String {
        self.engine
            .with_store::<I, O, _>(self.id, |store| store.name().to_string())
    }

    /// Installs the body of a function created with
    /// [`FunctionBuilder::declare`]. Panics if a body is already installed.
    pub fn define<F>(&self, body: F)
    where
        F: Fn(Context, I) -> Task<O> + 'static,
    {
        self.engine
            .with_store::<I, O, _>(self.id, |store| store.install_body(Rc::new(body)));
    }

    /// Interns and returns the cell for `input`.
    pub fn cell(&self, input: I) -> Cell<I, O> {
        let slot = self.intern(input);
        Cell {
            slot,
            engine: self.engine.clone(),
        }
    }

    /// An invalidation that marks every cell of this function.
    pub fn invalidate_cache(&self) -> Invalidation {
        Invalidation::function(self.id)
    }

    pub(crate) fn intern(&self, input: I) -> Arc<Slot<I, O>> {
        let engine = self.engine.clone();
        self.engine
            .with_store::<I, O, _>(self.id, move |store| store.intern(&engine, input))
    }

    pub(crate) fn lookup(&self, input: &I) -> Option<Arc<Slot<I, O>>> {
        self.engine
            .with_store::<I, O, _>(self.id, |store| store.lookup(input))
    }
}

/// A cell handle: the interned `(function, input)` pair.
pub struct Cell<I, O> {
    pub(crate) slot: Arc<Slot<I, O>>,
    pub(crate) engine: Engine,
}

impl<I, O> Clone for Cell<I, O> {
    fn clone(&self) -> Self {
        Cell {
            slot: self.slot.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<I, O> Cell<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    /// The globally unique id of this cell.
    pub fn id(&self) -> CellId {
        AnyCell::id(&*self.slot)
    }

    /// Demands the cell's value, restoring or computing as needed.
    pub fn read(&self, ctx: &Context) -> Task<O> {
        let ctx = ctx.clone();
        let slot = self.slot.clone();
        async move { ctx.demand(slot).await }.boxed_local()
    }

    /// An invalidation that marks this one cell.
    pub fn invalidate(&self) -> Invalidation {
        Invalidation::cell(self.id())
    }

    /// The cached value, if one is currently held. Never executes.
    pub fn peek(&self) -> Option<O> {
        self.slot.peek()
    }
}

impl<I, O> fmt::Debug for Cell<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{}({})",
            AnyCell::name(&*self.slot),
            AnyCell::input_debug(&*self.slot)
        )
    }
}

/// Builder returned by [`Engine::function`].
pub struct FunctionBuilder<I, O> {
    pub(crate) engine: Engine,
    pub(crate) name: String,
    pub(crate) cutoff: Option<Rc<CutoffFn<O>>>,
    pub(crate) _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> FunctionBuilder<I, O>
where
    I: Clone + fmt::Debug + Eq + Hash + 'static,
    O: Clone + fmt::Debug + 'static,
{
    /// Sets the early-cutoff predicate: when a recomputed output is equal to
    /// the previous one, dependents are not re-executed.
    pub fn cutoff<F>(mut self, eq: F) -> Self
    where
        F: Fn(&O, &O) -> bool + 'static,
    {
        self.cutoff = Some(Rc::new(eq));
        self
    }

    /// Shorthand for a cutoff based on `PartialEq`.
    pub fn cutoff_eq(self) -> Self
    where
        O: PartialEq,
    {
        self.cutoff(|a, b| a == b)
    }

    /// Registers the function with the given body.
    pub fn build<F>(self, body: F) -> Function<I, O>
    where
        F: Fn(Context, I) -> Task<O> + 'static,
    {
        let f = self.declare();
        f.define(body);
        f
    }

    /// Registers the function without a body; install one with
    /// [`Function::define`]. The handle can be captured by the body's
    /// closure, which is how recursive functions are declared.
    pub fn declare(self) -> Function<I, O> {
        let FunctionBuilder {
            engine,
            name,
            cutoff,
            _marker,
        } = self;
        let id = engine.register_store(move |id| Store::<I, O>::new(id, Arc::from(name), cutoff));
        Function::from_parts(engine, id)
    }
}
