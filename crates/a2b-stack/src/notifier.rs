use std::fmt;

use crate::context::ContextId;
use crate::message::MessageRef;
use crate::stack::Stack;

/// Listener invoked synchronously for matching notifications.
pub type NotifyCallback = Box<dyn FnMut(&mut Stack, &MessageRef)>;
/// Hook run once when a notifier is unregistered.
pub type NotifierDestroy = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(pub u32);

pub(crate) struct Notifier {
    pub id: NotifierId,
    pub owner: ContextId,
    pub cmd: u32,
    /// Taken out while the callback runs.
    pub callback: Option<NotifyCallback>,
    pub destroy: Option<NotifierDestroy>,
}

impl Notifier {
    fn run_destroy(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy();
        }
    }
}

/// Registration-ordered notifier list.
#[derive(Default)]
pub(crate) struct NotifierList {
    entries: Vec<Notifier>,
    next_id: u32,
}

impl NotifierList {
    pub fn register(
        &mut self,
        owner: ContextId,
        cmd: u32,
        callback: NotifyCallback,
        destroy: Option<NotifierDestroy>,
    ) -> NotifierId {
        let id = NotifierId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push(Notifier {
            id,
            owner,
            cmd,
            callback: Some(callback),
            destroy,
        });
        id
    }

    pub fn unregister(&mut self, id: NotifierId) -> bool {
        let Some(pos) = self.entries.iter().position(|n| n.id == id) else {
            return false;
        };
        self.entries.remove(pos).run_destroy();
        true
    }

    /// Unregisters every notifier owned by `owner`, returning how many.
    pub fn unregister_owner(&mut self, owner: ContextId) -> usize {
        let mut removed = 0;
        self.entries.retain_mut(|n| {
            if n.owner == owner {
                n.run_destroy();
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Ids of notifiers filtering on `cmd`, in registration order.
    pub fn matching(&self, cmd: u32) -> Vec<NotifierId> {
        self.entries
            .iter()
            .filter(|n| n.cmd == cmd)
            .map(|n| n.id)
            .collect()
    }

    pub fn take_callback(&mut self, id: NotifierId) -> Option<NotifyCallback> {
        self.entries
            .iter_mut()
            .find(|n| n.id == id)
            .and_then(|n| n.callback.take())
    }

    /// Puts a callback back; dropped if the notifier was unregistered meanwhile.
    pub fn restore_callback(&mut self, id: NotifierId, callback: NotifyCallback) {
        if let Some(n) = self.entries.iter_mut().find(|n| n.id == id) {
            n.callback = Some(callback);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        for mut n in self.entries.drain(..) {
            n.run_destroy();
        }
    }
}

impl fmt::Debug for NotifierList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierList")
            .field("entries", &self.entries.len())
            .finish()
    }
}
