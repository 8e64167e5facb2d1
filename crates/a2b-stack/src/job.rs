use std::any::Any;
use std::rc::Rc;

use crate::executor::JobExecutor;

/// Scheduling action returned by a job and applied to its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the job at the head; do not run it again until updated.
    Suspend,
    /// Run the head job again on its next due tick.
    Schedule,
    /// Pop and finalize the head job.
    Complete,
}

/// Unit of deferred work held by a job queue.
///
/// A job is shared (`Rc`) so that the executor can run it while it stays
/// at the head of its queue. Dropping the last reference is the destroy
/// step; `complete` runs exactly once before that, either after the job
/// finished or when its queue is flushed (`cancelled == true`).
pub trait Job<H> {
    fn execute(self: Rc<Self>, host: &mut H) -> Action;
    fn complete(self: Rc<Self>, host: &mut H, cancelled: bool);
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

pub type JobRef<H> = Rc<dyn Job<H>>;

/// Owner of a [`JobExecutor`] whose jobs run against the owner itself.
pub trait JobHost: Sized {
    fn executor(&mut self) -> &mut JobExecutor<Self>;
}

pub(crate) fn same_job<H>(a: &JobRef<H>, b: &JobRef<H>) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a) as *const (),
        Rc::as_ptr(b) as *const (),
    )
}
