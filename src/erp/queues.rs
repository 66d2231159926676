// Per-adapter action queues and worker signalling.
//
// The ready queue holds runnable actions in FIFO order; the running queue
// holds actions that were started and are suspended awaiting a hardware
// completion, a timeout, or a low-memory deferral. The sum of both always
// equals the outstanding counter.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::action::{ActionFlags, ErpAction};

#[derive(Debug)]
pub(crate) struct ErpQueues {
    pub ready: VecDeque<Arc<ErpAction>>,
    pub running: Vec<Arc<ErpAction>>,
    /// Total actions admitted and not yet finalized.
    pub outstanding: u32,
    /// Worker exit request (adapter detach).
    pub shutdown: bool,
}

impl ErpQueues {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            running: Vec::new(),
            outstanding: 0,
            shutdown: false,
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.outstanding == 0
    }

    /// True when every outstanding action is parked on a low-memory
    /// deferral, i.e. the whole adapter is memory-starved.
    pub fn all_low_memory(&self) -> bool {
        self.outstanding > 0
            && self.ready.is_empty()
            && self
                .running
                .iter()
                .all(|a| a.flags().contains(ActionFlags::LOW_MEMORY))
    }

    pub fn remove_from_ready(&mut self, action: &ErpAction) -> bool {
        if let Some(idx) = self.ready.iter().position(|a| a.id() == action.id()) {
            self.ready.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn remove_from_running(&mut self, action: &ErpAction) -> bool {
        if let Some(idx) = self.running.iter().position(|a| a.id() == action.id()) {
            self.running.remove(idx);
            true
        } else {
            false
        }
    }
}

/// The action lock, the worker wake signal, and the quiescence signal of one
/// adapter.
pub(crate) struct ErpChannel {
    queues: Mutex<ErpQueues>,
    wake: Condvar,
    quiesced: Condvar,
}

impl ErpChannel {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(ErpQueues::new()),
            wake: Condvar::new(),
            quiesced: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ErpQueues> {
        self.queues.lock().unwrap()
    }

    /// Admit a new action at the tail of the ready queue.
    pub fn enqueue_ready(&self, queues: &mut ErpQueues, action: Arc<ErpAction>) {
        queues.ready.push_back(action);
        queues.outstanding += 1;
        self.wake.notify_all();
    }

    /// Move a suspended action back to the head of the ready queue so the
    /// worker resumes it before starting anything new.
    pub fn resume(&self, queues: &mut ErpQueues, action: &Arc<ErpAction>) {
        if queues.remove_from_running(action) {
            queues.ready.push_front(Arc::clone(action));
        }
        self.wake.notify_all();
    }

    /// Finalization bookkeeping: the action left both queues for good.
    pub fn retire(&self, queues: &mut ErpQueues) {
        queues.outstanding = queues.outstanding.saturating_sub(1);
        if queues.is_quiesced() {
            self.quiesced.notify_all();
        }
    }

    pub fn request_shutdown(&self) {
        let mut queues = self.lock();
        queues.shutdown = true;
        self.wake.notify_all();
    }

    /// Block until the worker should act: a ready action, a shutdown
    /// request, or the nearest deadline among suspended actions.
    pub fn wait_for_work<'a>(
        &'a self,
        queues: MutexGuard<'a, ErpQueues>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, ErpQueues> {
        match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                self.wake.wait_timeout(queues, timeout).unwrap().0
            }
            None => self.wake.wait(queues).unwrap(),
        }
    }

    /// Block until both queues are empty.
    pub fn wait_quiesced(&self) {
        let mut queues = self.lock();
        while !queues.is_quiesced() {
            queues = self.quiesced.wait(queues).unwrap();
        }
    }

    /// Block until both queues are empty or `timeout` elapses. Returns true
    /// on quiescence.
    pub fn wait_quiesced_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queues = self.lock();
        while !queues.is_quiesced() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self.quiesced.wait_timeout(queues, remaining).unwrap();
            queues = guard;
            if result.timed_out() && !queues.is_quiesced() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::action::ActionKind;
    use crate::topology::{Adapter, Wwpn};

    fn port_action(adapter: &Arc<Adapter>, wwpn: u64) -> Arc<ErpAction> {
        let port = adapter.attach_port(Wwpn(wwpn), false);
        ErpAction::new(
            ActionKind::ReopenPort,
            "test",
            Arc::clone(adapter),
            Some(port),
            None,
        )
    }

    #[test]
    fn test_enqueue_and_retire_track_outstanding() {
        let adapter = Adapter::new("fc0");
        let channel = ErpChannel::new();
        let action = port_action(&adapter, 0x1);

        let mut queues = channel.lock();
        channel.enqueue_ready(&mut queues, Arc::clone(&action));
        assert_eq!(queues.outstanding, 1);
        assert_eq!(queues.ready.len() + queues.running.len(), 1);

        queues.remove_from_ready(&action);
        channel.retire(&mut queues);
        assert!(queues.is_quiesced());
    }

    #[test]
    fn test_resume_moves_running_to_ready_head() {
        let adapter = Adapter::new("fc0");
        let channel = ErpChannel::new();
        let first = port_action(&adapter, 0x1);
        let second = port_action(&adapter, 0x2);

        let mut queues = channel.lock();
        channel.enqueue_ready(&mut queues, Arc::clone(&first));
        channel.enqueue_ready(&mut queues, Arc::clone(&second));

        // Simulate the worker starting `first`.
        let popped = queues.ready.pop_front().unwrap();
        queues.running.push(popped);

        channel.resume(&mut queues, &first);
        assert_eq!(queues.ready.front().unwrap().id(), first.id());
        assert!(queues.running.is_empty());
    }

    #[test]
    fn test_all_low_memory_requires_every_runner_starved() {
        let adapter = Adapter::new("fc0");
        let channel = ErpChannel::new();
        let first = port_action(&adapter, 0x1);
        let second = port_action(&adapter, 0x2);

        let mut queues = channel.lock();
        channel.enqueue_ready(&mut queues, Arc::clone(&first));
        channel.enqueue_ready(&mut queues, Arc::clone(&second));
        queues.running = queues.ready.drain(..).collect();

        assert!(!queues.all_low_memory());
        first.set_flags(ActionFlags::LOW_MEMORY);
        assert!(!queues.all_low_memory());
        second.set_flags(ActionFlags::LOW_MEMORY);
        assert!(queues.all_low_memory());
    }

    #[test]
    fn test_wait_quiesced_timeout_expires() {
        let adapter = Adapter::new("fc0");
        let channel = ErpChannel::new();
        let action = port_action(&adapter, 0x1);

        {
            let mut queues = channel.lock();
            channel.enqueue_ready(&mut queues, action);
        }
        assert!(!channel.wait_quiesced_timeout(Duration::from_millis(20)));
    }
}
