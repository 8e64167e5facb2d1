use std::collections::VecDeque;
use std::fmt;

use a2b_core::A2bError;

use crate::heap::HeapLease;
use crate::job::{Action, JobRef};

/// Number of positions in the executor's rotating schedule mask.
pub const SCHEDULE_SLOTS: u32 = 9;

/// Static priority masks, index 0 is the highest priority.
///
/// Bit counts are 9, 4, 3, 2 and 1, so over one full rotation a busy queue
/// is serviced 9/9, 4/9, 3/9, 2/9 and 1/9 of the ticks respectively.
pub const PRIORITY_MASKS: [u16; 5] = [0x1FF, 0x0AA, 0x124, 0x082, 0x010];

/// Mailbox scheduling priority (0 = highest, 4 = lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    /// Priority of the default mailbox created with every plugin context.
    pub const DEFAULT_MAILBOX: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(4);

    pub fn new(level: u8) -> Result<Self, A2bError> {
        if usize::from(level) < PRIORITY_MASKS.len() {
            Ok(Self(level))
        } else {
            Err(A2bError::InvalidParameter("priority out of range"))
        }
    }

    pub fn level(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u16 {
        PRIORITY_MASKS[usize::from(self.0)]
    }
}

/// Handle of a job queue owned by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub u32);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbox{}", self.0)
    }
}

/// FIFO of jobs with a static priority and a current scheduling action.
pub struct JobQueue<H> {
    id: MailboxId,
    priority: Priority,
    action: Action,
    jobs: VecDeque<JobRef<H>>,
    refs: u32,
    _lease: HeapLease,
}

impl<H> JobQueue<H> {
    pub(crate) fn new(id: MailboxId, priority: Priority, lease: HeapLease) -> Self {
        Self {
            id,
            priority,
            action: Action::Suspend,
            jobs: VecDeque::new(),
            refs: 1,
            _lease: lease,
        }
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn ref_count(&self) -> u32 {
        self.refs
    }

    pub fn head(&self) -> Option<&JobRef<H>> {
        self.jobs.front()
    }

    /// Whether the head job should run on a tick with `schedule_mask`.
    pub fn is_due(&self, schedule_mask: u16) -> bool {
        self.action == Action::Schedule
            && (self.priority.mask() & schedule_mask) != 0
            && !self.jobs.is_empty()
    }

    /// Appends a job. Submitting into an empty queue arms it.
    pub(crate) fn submit(&mut self, job: JobRef<H>) {
        let was_empty = self.jobs.is_empty();
        self.jobs.push_back(job);
        if was_empty {
            self.action = Action::Schedule;
        }
    }

    pub(crate) fn pop_head(&mut self) -> Option<JobRef<H>> {
        self.jobs.pop_front()
    }

    pub(crate) fn set_action(&mut self, action: Action) {
        self.action = action;
    }

    /// Schedules the queue again if jobs remain, suspends it otherwise.
    pub(crate) fn rearm(&mut self) {
        self.action = if self.jobs.is_empty() {
            Action::Suspend
        } else {
            Action::Schedule
        };
    }

    pub(crate) fn retain(&mut self) {
        self.refs += 1;
    }

    /// Drops one reference, returning the remaining count.
    pub(crate) fn release(&mut self) -> u32 {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }
}

impl<H> fmt::Debug for JobQueue<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("action", &self.action)
            .field("jobs", &self.jobs.len())
            .field("refs", &self.refs)
            .finish()
    }
}
