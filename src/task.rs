//! The cooperative task layer.
//!
//! Tasks are single-threaded local futures resolving to `Result<T, Errors>`.
//! Fork-and-join always settles both children and aggregates their errors;
//! there is no cancellation and no preemption. Suspension points are awaits
//! on unresolved tasks, [`yield_now`], lifted external fibers, and waiting on
//! a cell that another task is currently computing.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as PollContext, Poll};

use futures::future::{self, FutureExt, LocalBoxFuture};

use crate::{Errors, MemoError};

/// A unit of cooperative work producing `T` or a set of aggregated errors.
pub type Task<T> = LocalBoxFuture<'static, Result<T, Errors>>;

/// Runs `a` and `b` concurrently and waits for both, even if one fails.
/// Errors from the two sides are aggregated.
pub fn join<A, B>(a: Task<A>, b: Task<B>) -> Task<(A, B)>
where
    A: 'static,
    B: 'static,
{
    future::join(a, b)
        .map(|(ra, rb)| match (ra, rb) {
            (Ok(va), Ok(vb)) => Ok((va, vb)),
            (Err(ea), Ok(_)) => Err(ea),
            (Ok(_), Err(eb)) => Err(eb),
            (Err(mut ea), Err(eb)) => {
                ea.union(eb);
                Err(ea)
            }
        })
        .boxed_local()
}

/// [`join`] for side-effecting children, discarding the values.
pub fn join_unit(a: Task<()>, b: Task<()>) -> Task<()> {
    join(a, b).map(|r| r.map(|((), ())| ())).boxed_local()
}

/// Surrenders to the scheduler; other ready tasks may run before this one
/// resumes.
pub fn yield_now() -> impl Future<Output = ()> {
    YieldNow { polled: false }
}

struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Lifts an external cooperative computation into the task type.
///
/// The fiber is assumed to be reproducible: it must not observe side effects
/// the engine cannot account for, or memoized results that consumed it will
/// go stale silently.
pub fn from_fiber<T, F>(fut: F) -> Task<T>
where
    T: 'static,
    F: Future<Output = T> + 'static,
{
    fut.map(Ok).boxed_local()
}

/// Runs `task` and collects every distinct error raised in its subtree.
pub async fn collect_errors<T>(task: Task<T>) -> Result<T, Vec<MemoError>> {
    task.await.map_err(|errors| errors.into_vec())
}
