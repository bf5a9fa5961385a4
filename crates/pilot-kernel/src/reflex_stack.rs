//! [`ReflexStack`] – LIFO stack of reflex frames that freezes goal
//! arbitration while any frame is active.
//!
//! A reflex is a short, high-priority interruption of deliberate goal
//! execution (dodge, eat, surface for air).  While one runs, the goal
//! manager must not switch goals out from under it, so the stack drives an
//! [`ArbitrationGate`]:
//!
//! * [`push`][ReflexStack::push] locks the gate on the empty → non-empty
//!   transition only.
//! * [`pop`][ReflexStack::pop] unlocks the gate only when the stack becomes
//!   empty again – exactly once per depth 1 → 0 transition.  No prior goal
//!   is remembered or force-resumed; arbitration simply restarts from
//!   scratch on the next tick.
//! * [`clear`][ReflexStack::clear] empties the stack and unconditionally
//!   unlocks.  Used on fatal resets (agent death, disconnect).

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::debug;

/// The seam between the reflex stack and the goal manager.
///
/// The goal manager supplies an implementation whose `lock`/`unlock` suspend
/// and resume arbitration.  Implementations must tolerate redundant `unlock`
/// calls (the [`ReflexStack::clear`] fatal path unlocks unconditionally).
pub trait ArbitrationGate: Send + Sync {
    /// Suspend goal arbitration.
    fn lock(&self);
    /// Resume goal arbitration.
    fn unlock(&self);
}

/// One active reflex, with free-form context for diagnostics.
#[derive(Debug, Clone)]
pub struct ReflexFrame {
    pub name: String,
    pub context: BTreeMap<String, String>,
    pub started: Instant,
}

/// LIFO stack of [`ReflexFrame`]s owning an [`ArbitrationGate`].
pub struct ReflexStack {
    frames: Vec<ReflexFrame>,
    gate: Box<dyn ArbitrationGate>,
}

impl ReflexStack {
    /// Create an empty stack around the given gate.
    pub fn new(gate: Box<dyn ArbitrationGate>) -> Self {
        Self {
            frames: Vec::new(),
            gate,
        }
    }

    /// Push a frame.  Locks the gate if the stack was empty.
    pub fn push(&mut self, name: impl Into<String>, context: BTreeMap<String, String>) {
        let name = name.into();
        if self.frames.is_empty() {
            self.gate.lock();
        }
        debug!(reflex = %name, depth = self.frames.len() + 1, "reflex pushed");
        self.frames.push(ReflexFrame {
            name,
            context,
            started: Instant::now(),
        });
    }

    /// Pop the top frame, returning it.  Unlocks the gate only when the
    /// stack becomes empty.
    pub fn pop(&mut self) -> Option<ReflexFrame> {
        let frame = self.frames.pop()?;
        debug!(reflex = %frame.name, depth = self.frames.len(), "reflex popped");
        if self.frames.is_empty() {
            self.gate.unlock();
        }
        Some(frame)
    }

    /// Empty the stack and unconditionally unlock.  Fatal-reset path.
    pub fn clear(&mut self) {
        if !self.frames.is_empty() {
            debug!(dropped = self.frames.len(), "reflex stack cleared");
        }
        self.frames.clear();
        self.gate.unlock();
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Name of the top frame, if any.
    pub fn current(&self) -> Option<&str> {
        self.frames.last().map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gate that counts lock/unlock calls.
    #[derive(Default)]
    struct CountingGate {
        locks: AtomicUsize,
        unlocks: AtomicUsize,
    }

    impl ArbitrationGate for Arc<CountingGate> {
        fn lock(&self) {
            self.locks.fetch_add(1, Ordering::SeqCst);
        }
        fn unlock(&self) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stack_with_gate() -> (ReflexStack, Arc<CountingGate>) {
        let gate = Arc::new(CountingGate::default());
        (ReflexStack::new(Box::new(Arc::clone(&gate))), gate)
    }

    #[test]
    fn push_locks_only_on_first_frame() {
        let (mut stack, gate) = stack_with_gate();
        stack.push("dodge", BTreeMap::new());
        stack.push("eat", BTreeMap::new());
        stack.push("flee", BTreeMap::new());
        assert_eq!(gate.locks.load(Ordering::SeqCst), 1);
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn triple_push_pop_unlocks_exactly_once() {
        let (mut stack, gate) = stack_with_gate();
        for name in ["a", "b", "c"] {
            stack.push(name, BTreeMap::new());
        }
        for _ in 0..3 {
            stack.pop();
        }
        assert_eq!(gate.unlocks.load(Ordering::SeqCst), 1);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn pop_returns_frames_in_lifo_order() {
        let (mut stack, _gate) = stack_with_gate();
        stack.push("first", BTreeMap::new());
        stack.push("second", BTreeMap::new());
        assert_eq!(stack.current(), Some("second"));
        assert_eq!(stack.pop().unwrap().name, "second");
        assert_eq!(stack.pop().unwrap().name, "first");
        assert!(stack.pop().is_none());
    }

    #[test]
    fn pop_on_empty_stack_is_noop() {
        let (mut stack, gate) = stack_with_gate();
        assert!(stack.pop().is_none());
        assert_eq!(gate.unlocks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_unlocks_unconditionally() {
        let (mut stack, gate) = stack_with_gate();
        stack.push("dodge", BTreeMap::new());
        stack.push("eat", BTreeMap::new());
        stack.clear();
        assert_eq!(stack.depth(), 0);
        assert_eq!(gate.unlocks.load(Ordering::SeqCst), 1);
        // Fatal paths may clear an already-empty stack.
        stack.clear();
        assert_eq!(gate.unlocks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn relock_after_drain() {
        let (mut stack, gate) = stack_with_gate();
        stack.push("a", BTreeMap::new());
        stack.pop();
        stack.push("b", BTreeMap::new());
        assert_eq!(gate.locks.load(Ordering::SeqCst), 2);
        assert_eq!(gate.unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_context_is_preserved() {
        let (mut stack, _gate) = stack_with_gate();
        let mut ctx = BTreeMap::new();
        ctx.insert("threat".to_string(), "creeper".to_string());
        stack.push("flee", ctx);
        let frame = stack.pop().unwrap();
        assert_eq!(frame.context.get("threat").unwrap(), "creeper");
    }
}
