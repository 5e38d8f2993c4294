//! Hashed timing wheel with O(1) arm/disarm and bounded per-tick work.
//!
//! Single-level, power-of-two slots over a generational [`Slab`]. Timers are
//! long-lived: a slot is allocated once, then armed and disarmed any number of
//! times until it is released. The registry never runs callbacks itself; the
//! owner collects the due set with [`TimerRegistry::collect_due`] and fires each
//! entry between [`TimerRegistry::take_for_fire`] and
//! [`TimerRegistry::finish_fire`], so callbacks can touch the registry again.

use core::num::NonZeroUsize;

use serde::Serialize;

use crate::runtime::timing::slab::{Slab, SlabIndex};
use crate::runtime::timing::tick::{TickInstant, TickSpan};

type NodeIndex<C> = SlabIndex<TimerNode<C>>;

/// Identity of an allocated timer slot; stale once the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    idx: u32,
    generation: u32,
}

impl TimerId {
    /// Slot index within the registry.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.idx
    }

    /// Generation the slot was allocated under.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Lifecycle of a timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimerState {
    /// Allocated, not armed.
    Idle,
    /// Linked into the wheel, waiting for its deadline.
    Armed,
    /// Collected by the current advance, callback not run yet.
    Firing,
    /// Fired; stays here until rearmed.
    Expired,
}

/// Wheel statistics, kept for the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WheelStats {
    /// Most timers fired by a single advance.
    pub max_fired_per_tick: usize,
    /// Longest slot chain walked.
    pub max_slot_depth: usize,
    /// Peak number of allocated timer slots.
    pub high_water: usize,
}

/// One entry of the due set produced by [`TimerRegistry::collect_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Due {
    id: TimerId,
    deadline: TickInstant,
    seq: u64,
}

impl Due {
    /// Timer that came due.
    #[must_use]
    pub const fn id(&self) -> TimerId {
        self.id
    }

    /// Deadline it was armed for.
    #[must_use]
    pub const fn deadline(&self) -> TickInstant {
        self.deadline
    }
}

struct TimerNode<C> {
    state: TimerState,
    duration: Option<TickSpan>,
    deadline: TickInstant,
    /// Arm order, breaks ties between equal deadlines.
    arm_seq: u64,
    callback: Option<C>,
    /// No handle owns the slot; it is freed after firing.
    detached: bool,
    next: Option<NodeIndex<C>>,
    prev: Option<NodeIndex<C>>,
}

impl<C> TimerNode<C> {
    fn new(detached: bool) -> Self {
        Self {
            state: TimerState::Idle,
            duration: None,
            deadline: TickInstant::default(),
            arm_seq: 0,
            callback: None,
            detached,
            next: None,
            prev: None,
        }
    }
}

/// Hashed timing wheel holding callbacks of type `C`.
pub struct TimerRegistry<C> {
    slots: Vec<Option<NodeIndex<C>>>, // head of list per slot
    slab: Slab<TimerNode<C>>,
    mask: usize,
    /// First tick not advanced yet.
    cursor: TickInstant,
    /// Tick currently being processed.
    now: TickInstant,
    next_seq: u64,
    armed: usize,
    stats: WheelStats,
}

impl<C> TimerRegistry<C> {
    /// Creates a registry with `slots` wheel slots and room for `capacity` timers.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is not a power of two.
    #[must_use]
    pub fn new(slots: usize, capacity: NonZeroUsize) -> Self {
        assert!(
            slots.is_power_of_two(),
            "wheel slots must be a power of two"
        );
        Self {
            slots: vec![None; slots],
            slab: Slab::with_capacity(capacity),
            mask: slots - 1,
            cursor: TickInstant::default(),
            now: TickInstant::default(),
            next_seq: 0,
            armed: 0,
            stats: WheelStats::default(),
        }
    }

    /// Maximum number of timers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Allocated timer slots.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.slab.len()
    }

    /// Timers currently linked into the wheel.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.armed
    }

    #[must_use]
    pub fn stats(&self) -> WheelStats {
        self.stats
    }

    /// Tick set by the last [`TimerRegistry::begin_tick`].
    #[must_use]
    pub fn now(&self) -> TickInstant {
        self.now
    }

    /// Allocates an idle timer slot. `None` when the registry is full.
    pub fn alloc(&mut self, detached: bool) -> Option<TimerId> {
        let (idx, generation) = self.slab.alloc(TimerNode::new(detached))?;
        self.stats.high_water = self.stats.high_water.max(self.slab.len());
        Some(TimerId {
            idx: u32::from(idx),
            generation,
        })
    }

    /// Frees the slot, disarming it first. Returns the stored callback so the
    /// caller can drop it outside any borrow of the registry.
    pub fn release(&mut self, id: TimerId) -> Option<C> {
        let idx = self.resolve(id)?;
        if self.state_of(idx) == Some(TimerState::Armed) {
            self.unlink(idx);
        }
        self.slab
            .free(idx, id.generation)
            .and_then(|node| node.callback)
    }

    /// Stores duration and callback and (re)arms the timer.
    ///
    /// # Errors
    ///
    /// Returns the callback back if `id` is stale.
    pub fn set(&mut self, id: TimerId, duration: TickSpan, callback: C) -> Result<Option<C>, C> {
        let Some(idx) = self.resolve(id) else {
            return Err(callback);
        };
        let previous = match self.slab.get_any_mut(idx) {
            Some(node) => {
                node.duration = Some(duration);
                node.callback.replace(callback)
            }
            None => return Err(callback),
        };
        self.arm(idx);
        Ok(previous)
    }

    /// Rearms with the stored duration. `false` if stale or never set.
    pub fn run(&mut self, id: TimerId) -> bool {
        self.resolve(id).is_some_and(|idx| self.arm(idx))
    }

    /// Disarms without freeing. `false` if `id` is stale.
    pub fn stop(&mut self, id: TimerId) -> bool {
        let Some(idx) = self.resolve(id) else {
            return false;
        };
        match self.state_of(idx) {
            Some(TimerState::Armed) => {
                self.unlink(idx);
                self.set_state(idx, TimerState::Idle);
            }
            Some(TimerState::Firing) => self.set_state(idx, TimerState::Idle),
            _ => {}
        }
        true
    }

    #[must_use]
    pub fn state(&self, id: TimerId) -> Option<TimerState> {
        self.resolve(id).and_then(|idx| self.state_of(idx))
    }

    #[must_use]
    pub fn duration(&self, id: TimerId) -> Option<TickSpan> {
        let idx = self.resolve(id)?;
        self.slab.get_any(idx).and_then(|node| node.duration)
    }

    /// Deadline of an armed timer.
    #[must_use]
    pub fn deadline(&self, id: TimerId) -> Option<TickInstant> {
        let idx = self.resolve(id)?;
        self.slab
            .get_any(idx)
            .filter(|node| matches!(node.state, TimerState::Armed | TimerState::Firing))
            .map(|node| node.deadline)
    }

    /// Sets the tick used as the base for timers armed from now on.
    pub fn begin_tick(&mut self, now: TickInstant) {
        self.now = now;
    }

    /// Unlinks every timer with `deadline <= now` into `due`, sorted by
    /// `(deadline, arm order)`, and marks them [`TimerState::Firing`].
    ///
    /// Walks every slot between the last advance and `now` (at most one lap),
    /// so a jump of several ticks fires all intermediate deadlines.
    pub fn collect_due(&mut self, now: TickInstant, due: &mut Vec<Due>) {
        due.clear();
        self.now = self.now.max(now);
        if now < self.cursor {
            return;
        }
        let span = now.since(self.cursor).get().saturating_add(1);
        let walk = span.min(self.slots.len() as u64);
        let start = self.cursor.get();
        for step in 0..walk {
            let slot = (start.wrapping_add(step) as usize) & self.mask;
            let mut head = self.slots[slot];
            let mut depth = 0;
            while let Some(idx) = head {
                depth += 1;
                let Some(node) = self.slab.get_any(idx) else {
                    break;
                };
                head = node.next;
                if node.deadline > now {
                    continue;
                }
                let (deadline, seq) = (node.deadline, node.arm_seq);
                self.unlink(idx);
                self.set_state(idx, TimerState::Firing);
                if let Some(generation) = self.slab.generation(idx) {
                    due.push(Due {
                        id: TimerId {
                            idx: u32::from(idx),
                            generation,
                        },
                        deadline,
                        seq,
                    });
                }
            }
            self.stats.max_slot_depth = self.stats.max_slot_depth.max(depth);
        }
        self.cursor = now.next();
        due.sort_unstable_by_key(|d| (d.deadline, d.seq));
        self.stats.max_fired_per_tick = self.stats.max_fired_per_tick.max(due.len());
    }

    /// Takes the callback of a collected timer, marking it expired.
    ///
    /// `None` if the timer was released, stopped or rearmed since collection.
    pub fn take_for_fire(&mut self, due: &Due) -> Option<C> {
        let node = self.slab.get_mut(SlabIndex::from(due.id.idx), due.id.generation)?;
        if node.state != TimerState::Firing || node.arm_seq != due.seq {
            return None;
        }
        node.state = TimerState::Expired;
        node.callback.take()
    }

    /// Puts a fired callback back.
    ///
    /// Returns the callback when it has no home any more (timer released,
    /// replaced by `set` during the callback, or a detached one-shot, whose
    /// slot is freed here).
    pub fn finish_fire(&mut self, due: &Due, callback: C) -> Option<C> {
        let idx = SlabIndex::from(due.id.idx);
        let Some(node) = self.slab.get_mut(idx, due.id.generation) else {
            return Some(callback);
        };
        if node.detached && node.state == TimerState::Expired {
            self.slab.free(idx, due.id.generation);
            return Some(callback);
        }
        if node.callback.is_some() {
            return Some(callback);
        }
        node.callback = Some(callback);
        None
    }

    fn resolve(&self, id: TimerId) -> Option<NodeIndex<C>> {
        let idx = SlabIndex::from(id.idx);
        self.slab.get(idx, id.generation).map(|_| idx)
    }

    fn state_of(&self, idx: NodeIndex<C>) -> Option<TimerState> {
        self.slab.get_any(idx).map(|node| node.state)
    }

    fn set_state(&mut self, idx: NodeIndex<C>, state: TimerState) {
        if let Some(node) = self.slab.get_any_mut(idx) {
            node.state = state;
        }
    }

    /// Links the node at `max(now + duration, cursor)`. `false` without a duration.
    fn arm(&mut self, idx: NodeIndex<C>) -> bool {
        let Some(node) = self.slab.get_any(idx) else {
            return false;
        };
        let Some(duration) = node.duration else {
            return false;
        };
        if node.state == TimerState::Armed {
            self.unlink(idx);
        }
        let deadline = (self.now + duration).max(self.cursor);
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(node) = self.slab.get_any_mut(idx) {
            node.deadline = deadline;
            node.arm_seq = seq;
            node.state = TimerState::Armed;
        }
        self.link(idx);
        true
    }

    fn slot_of(&self, deadline: TickInstant) -> usize {
        (deadline.get() as usize) & self.mask
    }

    /// Inserts at the head of the deadline's slot list.
    fn link(&mut self, idx: NodeIndex<C>) {
        let Some(deadline) = self.slab.get_any(idx).map(|node| node.deadline) else {
            return;
        };
        let slot = self.slot_of(deadline);
        let head = self.slots[slot];
        if let Some(node) = self.slab.get_any_mut(idx) {
            node.next = head;
            node.prev = None;
        }
        if let Some(head_idx) = head
            && let Some(head_node) = self.slab.get_any_mut(head_idx)
        {
            head_node.prev = Some(idx);
        }
        self.slots[slot] = Some(idx);
        self.armed += 1;
    }

    fn unlink(&mut self, idx: NodeIndex<C>) {
        let Some((next, prev, deadline)) = self
            .slab
            .get_any_mut(idx)
            .map(|node| (node.next.take(), node.prev.take(), node.deadline))
        else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(pnode) = self.slab.get_any_mut(p) {
                    pnode.next = next;
                }
            }
            None => {
                // head of slot list
                let slot = self.slot_of(deadline);
                self.slots[slot] = next;
            }
        }
        if let Some(n) = next
            && let Some(nnode) = self.slab.get_any_mut(n)
        {
            nnode.prev = prev;
        }
        self.armed -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(slots: usize, capacity: usize) -> TimerRegistry<u32> {
        TimerRegistry::new(slots, NonZeroUsize::new(capacity).unwrap())
    }

    /// Runs one advance, returning fired payloads in firing order.
    fn advance(reg: &mut TimerRegistry<u32>, now: u64) -> Vec<u32> {
        let now = TickInstant::new(now);
        reg.begin_tick(now);
        let mut due = Vec::new();
        reg.collect_due(now, &mut due);
        let mut fired = Vec::new();
        for d in &due {
            if let Some(v) = reg.take_for_fire(d) {
                fired.push(v);
                let _ = reg.finish_fire(d, v);
            }
        }
        fired
    }

    fn armed_timer(reg: &mut TimerRegistry<u32>, duration: u64, payload: u32) -> TimerId {
        let id = reg.alloc(false).unwrap();
        assert!(reg.set(id, TickSpan::new(duration), payload).is_ok());
        id
    }

    #[test]
    fn fires_at_deadline_not_before() {
        let mut reg = registry(8, 4);
        advance(&mut reg, 99);
        reg.begin_tick(TickInstant::new(100));
        let id = armed_timer(&mut reg, 2, 7);
        assert_eq!(reg.deadline(id), Some(TickInstant::new(102)));

        assert!(advance(&mut reg, 100).is_empty());
        assert!(advance(&mut reg, 101).is_empty());
        assert_eq!(advance(&mut reg, 102), vec![7]);
        assert_eq!(reg.state(id), Some(TimerState::Expired));
        assert!(advance(&mut reg, 103).is_empty(), "one-shot");
    }

    #[test]
    fn zero_duration_fires_on_next_advance_only() {
        let mut reg = registry(8, 2);
        reg.begin_tick(TickInstant::new(5));
        let mut due = Vec::new();
        reg.collect_due(TickInstant::new(5), &mut due);
        assert!(due.is_empty());

        // Armed after the advance at 5: cannot land on 5 any more.
        let id = armed_timer(&mut reg, 0, 1);
        assert_eq!(reg.deadline(id), Some(TickInstant::new(6)));
        assert_eq!(advance(&mut reg, 6), vec![1]);
    }

    #[test]
    fn catch_up_fires_intermediate_deadlines_in_order() {
        let mut reg = registry(4, 8);
        reg.begin_tick(TickInstant::new(0));
        armed_timer(&mut reg, 9, 9);
        armed_timer(&mut reg, 3, 3);
        armed_timer(&mut reg, 5, 5);
        armed_timer(&mut reg, 20, 20);

        assert_eq!(advance(&mut reg, 10), vec![3, 5, 9]);
        assert_eq!(reg.armed(), 1);
        assert_eq!(advance(&mut reg, 20), vec![20]);
    }

    #[test]
    fn equal_deadlines_fire_in_arm_order() {
        let mut reg = registry(8, 4);
        reg.begin_tick(TickInstant::new(0));
        let a = armed_timer(&mut reg, 2, 1);
        armed_timer(&mut reg, 2, 2);
        // Rearming moves `a` behind `b`.
        assert!(reg.run(a));
        assert_eq!(advance(&mut reg, 2), vec![2, 1]);
    }

    #[test]
    fn deadlines_beyond_one_lap_wait_their_turn() {
        let mut reg = registry(4, 2);
        reg.begin_tick(TickInstant::new(0));
        armed_timer(&mut reg, 6, 6);
        for t in 0..6 {
            assert!(advance(&mut reg, t).is_empty(), "tick {t}");
        }
        assert_eq!(advance(&mut reg, 6), vec![6]);
    }

    #[test]
    fn stop_and_release_prevent_firing() {
        let mut reg = registry(8, 4);
        reg.begin_tick(TickInstant::new(0));
        let stopped = armed_timer(&mut reg, 1, 1);
        let released = armed_timer(&mut reg, 1, 2);
        assert!(reg.stop(stopped));
        assert_eq!(reg.state(stopped), Some(TimerState::Idle));
        assert_eq!(reg.release(released), Some(2));
        assert!(advance(&mut reg, 1).is_empty());
        assert_eq!(reg.armed(), 0);
        assert_eq!(reg.allocated(), 1);
    }

    #[test]
    fn timer_disarmed_after_collection_is_skipped() {
        let mut reg = registry(8, 4);
        reg.begin_tick(TickInstant::new(0));
        let first = armed_timer(&mut reg, 1, 1);
        let second = armed_timer(&mut reg, 1, 2);
        let third = armed_timer(&mut reg, 1, 3);

        reg.begin_tick(TickInstant::new(1));
        let mut due = Vec::new();
        reg.collect_due(TickInstant::new(1), &mut due);
        assert_eq!(due.len(), 3);
        assert_eq!(due[0].id(), first);

        // As if the first callback released `second` and rearmed `third`.
        assert_eq!(reg.take_for_fire(&due[0]), Some(1));
        assert_eq!(reg.release(second), Some(2));
        assert!(reg.run(third));
        assert_eq!(reg.take_for_fire(&due[1]), None);
        assert_eq!(reg.take_for_fire(&due[2]), None);
        assert_eq!(reg.deadline(third), Some(TickInstant::new(2)));
    }

    #[test]
    fn stale_id_is_rejected() {
        let mut reg = registry(8, 1);
        let old = reg.alloc(false).unwrap();
        reg.release(old);
        let new = reg.alloc(false).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(!reg.run(old));
        assert_eq!(reg.set(old, TickSpan::ONE, 5), Err(5));
        assert!(reg.state(old).is_none());
        assert_eq!(reg.state(new), Some(TimerState::Idle));
    }

    #[test]
    fn capacity_exhaustion() {
        let mut reg = registry(8, 1);
        assert!(reg.alloc(false).is_some());
        assert!(reg.alloc(false).is_none(), "should fail when slab is full");
        assert_eq!(reg.stats().high_water, 1);
    }

    #[test]
    fn run_without_duration_fails() {
        let mut reg = registry(8, 1);
        let id = reg.alloc(false).unwrap();
        assert!(!reg.run(id));
        assert_eq!(reg.duration(id), None);
    }

    #[test]
    fn detached_timer_frees_its_slot_after_firing() {
        let mut reg = registry(8, 1);
        reg.begin_tick(TickInstant::new(0));
        let id = reg.alloc(true).unwrap();
        assert!(reg.set(id, TickSpan::new(1), 4).is_ok());
        assert_eq!(advance(&mut reg, 1), vec![4]);
        assert_eq!(reg.allocated(), 0);
        assert!(reg.state(id).is_none());
    }

    #[test]
    fn set_during_fire_keeps_new_callback() {
        let mut reg = registry(8, 1);
        reg.begin_tick(TickInstant::new(0));
        let id = armed_timer(&mut reg, 1, 1);
        reg.begin_tick(TickInstant::new(1));
        let mut due = Vec::new();
        reg.collect_due(TickInstant::new(1), &mut due);
        let fired = reg.take_for_fire(&due[0]).unwrap();
        assert_eq!(reg.set(id, TickSpan::new(1), 2), Ok(None));
        assert_eq!(reg.finish_fire(&due[0], fired), Some(1));
        assert_eq!(advance(&mut reg, 2), vec![2]);
    }
}
