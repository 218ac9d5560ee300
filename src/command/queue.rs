//! Command Queue
//!
//! Hands out command lists, submits them, and recycles them once the GPU is
//! done.
//!
//! ```text
//!   get_command_list()            submit(lists)                 worker thread
//!  ┌──────────────────┐   ┌───────────────────────────┐   ┌─────────────────────┐
//!  │ pool.available   │──►│ lock global states        │   │ recv Submitted      │
//!  │   or create (<N) │   │  close(list, aux)         │   │  fence.wait(token)  │
//!  │   or sleep+poll  │   │  [aux?] + list → execute  │   │  list.reset()       │
//!  └──────────────────┘   │ unlock                    │   │  → pool.available ──┼─┐
//!           ▲             │ signal(token)             │   └─────────────────────┘ │
//!           │             │ send Submitted(token, …)  │──────────► flume ─────────┘
//!           └─────────────┴───────────────────────────┘
//! ```
//!
//! Each submitted list gets an auxiliary list that receives its resolved
//! pending barriers. The auxiliary list executes right before the list it
//! belongs to, and only when it recorded something.
//!
//! A handed-out list holds a `PoolSlot`; dropping the list without
//! submitting it frees its place under the pool bound.
//!
//! Lock order: submission lock, then the global state table.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::list::CommandList;
use crate::errors::{EmberError, Result};
use crate::hal::{CommandEncoder, Device, Fence, NativeQueue, QueueKind};
use crate::settings::GpuSettings;
use crate::state::GlobalResourceStates;
use crate::token::CompletionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListRole {
    /// Handed out by `get_command_list`; counts against the pool bound.
    User,
    /// Carries resolved pending barriers for a user list.
    Auxiliary,
}

enum ReclaimMessage {
    Submitted {
        token: CompletionToken,
        list: CommandList,
        role: ListRole,
    },
    Flush(flume::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct ListPool {
    available: Vec<CommandList>,
    auxiliary: Vec<CommandList>,
    created: usize,
}

impl ListPool {
    fn give_back(&mut self, list: CommandList, role: ListRole) {
        match role {
            ListRole::User => self.available.push(list),
            ListRole::Auxiliary => self.auxiliary.push(list),
        }
    }

    fn release_slot(&mut self) {
        self.created = self.created.saturating_sub(1);
    }
}

/// One place under a queue's command list bound.
///
/// Travels with a user list through submission and reclamation, and is
/// released when the list is dropped.
pub(crate) struct PoolSlot {
    pool: Weak<Mutex<ListPool>>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().release_slot();
        }
    }
}

/// A native queue plus its command list pool and reclamation worker.
pub struct CommandQueue {
    kind: QueueKind,
    device: Arc<dyn Device>,
    settings: GpuSettings,
    global: Arc<GlobalResourceStates>,

    native: Arc<dyn NativeQueue>,
    fence: Arc<dyn Fence>,
    last_signalled: Mutex<CompletionToken>,

    pool: Arc<Mutex<ListPool>>,
    sender: flume::Sender<ReclaimMessage>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    pub fn new(
        device: Arc<dyn Device>,
        kind: QueueKind,
        settings: GpuSettings,
        global: Arc<GlobalResourceStates>,
    ) -> Result<Self> {
        let native = device
            .create_queue(kind)
            .inspect_err(|e| log::error!("Failed to create {kind:?} queue: {e}"))?;
        let fence = device
            .create_fence(CompletionToken::ZERO.value())
            .inspect_err(|e| log::error!("Failed to create {kind:?} queue fence: {e}"))?;

        let pool = Arc::new(Mutex::new(ListPool::default()));
        let (sender, receiver) = flume::unbounded();

        let worker = {
            let fence = fence.clone();
            let pool = pool.clone();
            thread::Builder::new()
                .name(format!("ember-{kind:?}-reclaim").to_lowercase())
                .spawn(move || reclaim_loop(&receiver, fence.as_ref(), &pool))
                .map_err(|e| EmberError::creation("reclamation worker", e.to_string()))?
        };

        log::debug!("Created {kind:?} command queue");

        Ok(Self {
            kind,
            device,
            settings,
            global,
            native,
            fence,
            last_signalled: Mutex::new(CompletionToken::ZERO),
            pool,
            sender,
            worker: Some(worker),
        })
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Take a command list from the pool.
    ///
    /// Creates a new one while fewer than
    /// [`max_command_lists_per_queue`](GpuSettings::max_command_lists_per_queue)
    /// exist; otherwise sleeps and polls until the worker returns one.
    pub fn get_command_list(&self) -> Result<CommandList> {
        loop {
            {
                let mut pool = self.pool.lock();
                if let Some(list) = pool.available.pop() {
                    return Ok(list);
                }
                if pool.created < self.settings.max_command_lists_per_queue {
                    pool.created += 1;
                    let created = pool.created;
                    drop(pool);

                    // Released again if creation fails.
                    let slot = PoolSlot {
                        pool: Arc::downgrade(&self.pool),
                    };
                    let mut list = self.create_list()?;
                    list.pool_slot = Some(slot);
                    log::info!("{:?} queue created command list {created}", self.kind);
                    return Ok(list);
                }
            }
            if self.sender.is_disconnected() {
                return Err(EmberError::QueueShutDown);
            }
            thread::sleep(self.settings.command_list_poll_interval);
        }
    }

    /// Submit one list. See [`submit`](Self::submit).
    pub fn submit_one(&self, list: CommandList) -> Result<CompletionToken> {
        self.submit(vec![list])
    }

    /// Close and execute `lists` in order and return the token that
    /// completes with them.
    ///
    /// Pending barriers are resolved and final states committed under the
    /// global state lock, which is held until the native execute returns.
    /// If any list fails to close or the execute fails, the committed states
    /// are rolled back and the lists are dropped.
    pub fn submit(&self, lists: Vec<CommandList>) -> Result<CompletionToken> {
        let elide = self.settings.elide_redundant_pending_barriers;
        let user_count = lists.len();

        let mut auxiliaries = Vec::with_capacity(user_count);
        for _ in 0..user_count {
            auxiliaries.push(self.acquire_auxiliary()?);
        }

        let mut last_signalled = self.last_signalled.lock();

        // (list, role, executes)
        let mut batch: Vec<(CommandList, ListRole, bool)> = Vec::with_capacity(user_count * 2);
        {
            let mut global = self.global.lock();
            for (mut list, mut aux) in lists.into_iter().zip(auxiliaries) {
                let closed = list
                    .close(&mut aux, &mut global, elide)
                    .and_then(|pending| aux.close_standalone().map(|()| pending));
                let pending = match closed {
                    Ok(pending) => pending,
                    Err(e) => {
                        global.rollback();
                        return Err(e);
                    }
                };
                // An empty auxiliary list is not executed but still goes
                // through reclamation to be reset.
                batch.push((aux, ListRole::Auxiliary, pending > 0));
                batch.push((list, ListRole::User, true));
            }

            let encoders: SmallVec<[&dyn CommandEncoder; 8]> = batch
                .iter()
                .filter(|(_, _, executes)| *executes)
                .map(|(list, _, _)| list.encoder())
                .collect();

            if let Err(e) = self.native.execute_command_lists(&encoders) {
                log::error!("{:?} queue failed to execute command lists: {e}", self.kind);
                global.rollback();
                return Err(e);
            }
            log::debug!(
                "{:?} queue executed {} command lists ({} submitted)",
                self.kind,
                encoders.len(),
                user_count
            );
        }

        let token = last_signalled.next();
        if let Err(e) = self.native.signal(self.fence.as_ref(), token.value()) {
            log::error!("{:?} queue failed to signal {token}: {e}", self.kind);
            return Err(e);
        }
        *last_signalled = token;
        drop(last_signalled);

        for (list, role, _) in batch {
            if self
                .sender
                .send(ReclaimMessage::Submitted { token, list, role })
                .is_err()
            {
                log::error!("{:?} queue worker is gone; dropping submitted list", self.kind);
            }
        }
        Ok(token)
    }

    /// Signal a new token without submitting work.
    pub fn signal(&self) -> Result<CompletionToken> {
        let mut last_signalled = self.last_signalled.lock();
        let token = last_signalled.next();
        self.native.signal(self.fence.as_ref(), token.value())?;
        *last_signalled = token;
        Ok(token)
    }

    /// Non-blocking completion check.
    #[must_use]
    pub fn is_complete(&self, token: CompletionToken) -> bool {
        self.fence.completed_value() >= token.value()
    }

    /// Block until `token` completes.
    pub fn wait_for(&self, token: CompletionToken) {
        if !self.is_complete(token) {
            self.fence.wait_for_value(token.value());
        }
    }

    /// Newest token the GPU has reached.
    #[must_use]
    pub fn completed_token(&self) -> CompletionToken {
        CompletionToken::new(self.fence.completed_value())
    }

    /// Newest token handed out by `submit` or `signal`.
    #[must_use]
    pub fn last_signalled_token(&self) -> CompletionToken {
        *self.last_signalled.lock()
    }

    /// Block until every submitted list has completed and been reclaimed.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = flume::bounded(1);
        self.sender
            .send(ReclaimMessage::Flush(ack))
            .map_err(|_| EmberError::QueueShutDown)?;
        done.recv().map_err(|_| EmberError::QueueShutDown)?;
        self.wait_for(self.last_signalled_token());
        Ok(())
    }

    /// Make this queue wait on the GPU until everything `other` has
    /// submitted so far completes. Does not block the CPU.
    pub fn wait_for_queue(&self, other: &CommandQueue) -> Result<()> {
        let token = other.last_signalled_token();
        self.native.wait(other.fence.as_ref(), token.value())
    }

    /// User-facing command lists created so far.
    #[must_use]
    pub fn command_list_count(&self) -> usize {
        self.pool.lock().created
    }

    /// User-facing command lists waiting in the pool.
    #[must_use]
    pub fn available_command_lists(&self) -> usize {
        self.pool.lock().available.len()
    }

    fn create_list(&self) -> Result<CommandList> {
        CommandList::new(
            self.device.clone(),
            self.kind,
            &self.settings,
            self.global.clone(),
        )
    }

    fn acquire_auxiliary(&self) -> Result<CommandList> {
        if let Some(list) = self.pool.lock().auxiliary.pop() {
            return Ok(list);
        }
        self.create_list()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("{:?} queue could not flush on drop: {e}", self.kind);
        }
        let _ = self.sender.send(ReclaimMessage::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("{:?} queue reclamation worker panicked", self.kind);
        }
    }
}

fn reclaim_loop(
    receiver: &flume::Receiver<ReclaimMessage>,
    fence: &dyn Fence,
    pool: &Mutex<ListPool>,
) {
    while let Ok(message) = receiver.recv() {
        match message {
            ReclaimMessage::Submitted {
                token,
                mut list,
                role,
            } => {
                fence.wait_for_value(token.value());
                match list.reset() {
                    Ok(()) => pool.lock().give_back(list, role),
                    Err(e) => {
                        log::error!("Failed to reset command list {}: {e}", list.id());
                        drop(list);
                    }
                }
            }
            ReclaimMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            ReclaimMessage::Shutdown => break,
        }
    }
    log::debug!("Reclamation worker stopped");
}
