use std::mem::size_of;
use std::rc::Rc;

use a2b_core::A2bError;
use tracing::{trace, warn};

use crate::heap::{Heap, HeapLease};
use crate::job::{same_job, Action, JobHost, JobRef};
use crate::queue::{JobQueue, MailboxId, Priority};

const FIRST_SLOT: u16 = 0x001;
const LAST_SLOT: u16 = 0x100;

/// Owns the job queues of one stack instance and the rotating schedule mask.
pub struct JobExecutor<H> {
    queues: Vec<JobQueue<H>>,
    schedule_mask: u16,
    next_id: u32,
    heap: Rc<Heap>,
    _lease: HeapLease,
}

impl<H> JobExecutor<H> {
    pub fn new(heap: Rc<Heap>) -> Result<Self, A2bError> {
        let lease = heap.try_alloc(size_of::<Self>())?;
        Ok(Self {
            queues: Vec::new(),
            schedule_mask: FIRST_SLOT,
            next_id: 0,
            heap,
            _lease: lease,
        })
    }

    /// Allocates an empty, suspended queue with one reference.
    pub fn alloc_queue(&mut self, priority: Priority) -> Result<MailboxId, A2bError> {
        let lease = self.heap.try_alloc(size_of::<JobQueue<H>>())?;
        let id = MailboxId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.queues.push(JobQueue::new(id, priority, lease));
        trace!(mailbox = %id, priority = priority.level(), "job queue allocated");
        Ok(id)
    }

    pub fn queue(&self, id: MailboxId) -> Option<&JobQueue<H>> {
        self.queues.iter().find(|q| q.id() == id)
    }

    fn queue_mut(&mut self, id: MailboxId) -> Option<&mut JobQueue<H>> {
        self.queues.iter_mut().find(|q| q.id() == id)
    }

    pub fn contains(&self, id: MailboxId) -> bool {
        self.queue(id).is_some()
    }

    /// Queue ids in scan order.
    pub fn queue_ids(&self) -> Vec<MailboxId> {
        self.queues.iter().map(JobQueue::id).collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn schedule_mask(&self) -> u16 {
        self.schedule_mask
    }

    pub fn head(&self, id: MailboxId) -> Option<JobRef<H>> {
        self.queue(id).and_then(|q| q.head().cloned())
    }

    /// Appends `job` to the tail of queue `id`.
    pub fn submit(&mut self, id: MailboxId, job: JobRef<H>) -> Result<(), A2bError> {
        let queue = self.queue_mut(id).ok_or(A2bError::DoesNotExist)?;
        queue.submit(job);
        Ok(())
    }

    /// Sets the action of queue `id` without touching its jobs.
    pub fn set_action(&mut self, id: MailboxId, action: Action) -> Result<(), A2bError> {
        let queue = self.queue_mut(id).ok_or(A2bError::DoesNotExist)?;
        queue.set_action(action);
        Ok(())
    }

    pub fn retain(&mut self, id: MailboxId) -> Result<(), A2bError> {
        let queue = self.queue_mut(id).ok_or(A2bError::DoesNotExist)?;
        queue.retain();
        Ok(())
    }

    fn advance_mask(&mut self) {
        self.schedule_mask <<= 1;
        if self.schedule_mask > LAST_SLOT {
            self.schedule_mask = FIRST_SLOT;
        }
    }

    fn unlink(&mut self, id: MailboxId) -> Option<JobQueue<H>> {
        let pos = self.queues.iter().position(|q| q.id() == id)?;
        Some(self.queues.remove(pos))
    }
}

/// Runs one scheduling pass and advances the rotating mask.
///
/// Every queue that is scheduled, non-empty, and whose priority mask
/// intersects the current schedule bit runs its head job once. Returns the
/// number of jobs executed.
pub fn schedule<H: JobHost>(host: &mut H) -> usize {
    let mask = host.executor().schedule_mask;
    let mut executed = 0;

    for id in host.executor().queue_ids() {
        let job = match host.executor().queue(id) {
            Some(queue) if queue.is_due(mask) => queue.head().cloned(),
            _ => None,
        };
        let Some(job) = job else {
            continue;
        };

        // The job may free its own queue; hold a reference across the call.
        if host.executor().retain(id).is_err() {
            continue;
        }
        let action = Rc::clone(&job).execute(host);
        executed += 1;

        // A job that already resolved itself through `update` is no longer
        // the head; its returned action no longer applies.
        let still_head = host
            .executor()
            .queue(id)
            .and_then(|q| q.head())
            .is_some_and(|head| same_job(head, &job));
        drop(job);
        if still_head {
            if let Err(err) = update(host, id, action) {
                warn!(mailbox = %id, %err, "failed to apply job action");
            }
        }
        if let Err(err) = release(host, id) {
            warn!(mailbox = %id, %err, "failed to release job queue");
        }
    }

    host.executor().advance_mask();
    trace!(mask = format_args!("{mask:#05x}"), executed, "schedule pass");
    executed
}

/// Applies `action` to queue `id`.
///
/// `Complete` pops the head job, runs its completion, and re-arms the queue
/// (scheduled if jobs remain, suspended otherwise). `Schedule` and
/// `Suspend` only set the queue action.
pub fn update<H: JobHost>(host: &mut H, id: MailboxId, action: Action) -> Result<(), A2bError> {
    match action {
        Action::Complete => {
            let executor = host.executor();
            let queue = executor.queue_mut(id).ok_or(A2bError::DoesNotExist)?;
            let job = queue
                .pop_head()
                .ok_or(A2bError::Internal("complete on empty job queue"))?;
            queue.retain();

            job.complete(host, false);

            if let Some(queue) = host.executor().queue_mut(id) {
                queue.rearm();
            }
            release(host, id)
        }
        Action::Schedule | Action::Suspend => host.executor().set_action(id, action),
    }
}

/// Drops one reference to queue `id`.
///
/// The last release unlinks the queue and flushes it: every job still
/// queued gets `complete(cancelled = true)` and is then destroyed.
pub fn release<H: JobHost>(host: &mut H, id: MailboxId) -> Result<(), A2bError> {
    let executor = host.executor();
    let queue = executor.queue_mut(id).ok_or(A2bError::DoesNotExist)?;
    if queue.release() > 0 {
        return Ok(());
    }
    let Some(queue) = executor.unlink(id) else {
        return Err(A2bError::Internal("job queue vanished during release"));
    };
    flush(host, queue);
    Ok(())
}

fn flush<H: JobHost>(host: &mut H, mut queue: JobQueue<H>) {
    let mut cancelled = 0usize;
    while let Some(job) = queue.pop_head() {
        job.complete(host, true);
        cancelled += 1;
    }
    trace!(mailbox = %queue.id(), cancelled, "job queue flushed");
}
