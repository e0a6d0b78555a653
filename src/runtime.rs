//! The reactive graph itself: arena storage, tracking context, propagation and batching.
//!
//! Modeled on the teacher crate's `Root`/`GLOBAL_ROOT` (a single arena-owning value reached
//! through thread-local storage), but the propagation algorithm here is the two-phase
//! "mark pending / check dirty" protocol rather than the teacher's eager topological-sort DFS,
//! and edges are created and retired live during a tracked run via a cursor, rather than
//! collected into a buffer and linked in afterwards.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use slotmap::SlotMap;

use crate::node::{Link, LinkId, Node, NodeFlags, NodeId};

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

/// Run `f` with access to the current thread's [`Runtime`]. There is exactly one runtime per
/// thread; the type is deliberately not `Send`/`Sync`.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    RUNTIME.with(f)
}

pub(crate) struct Runtime {
    nodes: RefCell<SlotMap<NodeId, Node>>,
    links: RefCell<SlotMap<LinkId, Link>>,
    /// The node whose tracked run is currently executing, if any. Reads of a cell while this is
    /// `Some` create/refresh an edge from the cell to this node.
    active_sub: Cell<Option<NodeId>>,
    /// The scope new effects/scopes register themselves with.
    active_scope: Cell<NodeId>,
    /// The implicit top-level scope, alive for the lifetime of the runtime.
    root_scope: NodeId,
    batch_depth: Cell<u32>,
    pending_effects: RefCell<VecDeque<NodeId>>,
}

impl Runtime {
    fn new() -> Self {
        let mut nodes = SlotMap::default();
        let root_scope = nodes.insert(Node::new(NodeFlags::SCOPE, None));
        Runtime {
            nodes: RefCell::new(nodes),
            links: RefCell::new(SlotMap::default()),
            active_sub: Cell::new(None),
            active_scope: Cell::new(root_scope),
            root_scope,
            batch_depth: Cell::new(0),
            pending_effects: RefCell::new(VecDeque::new()),
        }
    }

    pub fn root_scope(&self) -> NodeId {
        self.root_scope
    }

    pub fn active_scope(&self) -> NodeId {
        self.active_scope.get()
    }

    // ---------------------------------------------------------------- node creation / disposal

    pub fn create_node(&self, flags: NodeFlags, owner: Option<NodeId>) -> NodeId {
        let id = self.nodes.borrow_mut().insert(Node::new(flags, owner));
        if let Some(owner) = owner {
            if self.nodes.borrow().contains_key(owner) {
                self.nodes.borrow_mut()[owner].owned.push(id);
            }
        }
        id
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.nodes.borrow().contains_key(node)
    }

    pub fn with_node<R>(&self, node: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.borrow().get(node).map(f)
    }

    pub fn with_node_mut<R>(&self, node: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.borrow_mut().get_mut(node).map(f)
    }

    pub fn flags_of(&self, node: NodeId) -> NodeFlags {
        self.nodes
            .borrow()
            .get(node)
            .map(|n| n.flags)
            .unwrap_or_else(NodeFlags::empty)
    }

    pub fn version_of(&self, node: NodeId) -> u32 {
        self.nodes.borrow().get(node).map(|n| n.version).unwrap_or(0)
    }

    /// Bumps `node`'s version counter, marking it as having genuinely changed. Called after a
    /// non-no-op state cell write and after a derived cell's recompute lands on a changed value.
    pub fn bump_version(&self, node: NodeId) {
        self.with_node_mut(node, |n| n.version = n.version.wrapping_add(1));
    }

    /// Disposes `node`: unlinks every edge touching it, runs its cleanups, recursively disposes
    /// anything it owns (a scope's effects/child scopes), removes it from its owner's `owned`
    /// list, and frees its arena slot. Idempotent: disposing an already-disposed node is a no-op.
    pub fn dispose(&self, node: NodeId) {
        if !self.is_alive(node) {
            return;
        }
        // Dispose children first (effects/child scopes owned by a scope).
        let owned = self
            .nodes
            .borrow_mut()
            .get_mut(node)
            .map(|n| std::mem::take(&mut n.owned))
            .unwrap_or_default();
        for child in owned {
            self.dispose(child);
        }

        self.unlink_all_deps(node);
        self.unlink_all_subs(node);

        let (cleanups, owner) = self
            .nodes
            .borrow_mut()
            .get_mut(node)
            .map(|n| (std::mem::take(&mut n.cleanups), n.owner))
            .unwrap_or_default();
        for cb in cleanups {
            self.untrack(cb);
        }
        if let Some(owner) = owner {
            if let Some(owner_node) = self.nodes.borrow_mut().get_mut(owner) {
                owner_node.owned.retain(|&c| c != node);
            }
        }
        self.nodes.borrow_mut().remove(node);
        // A disposed node can no longer be meaningfully pending; the flush loop skips it because
        // `is_alive` is checked before every run.
    }

    // --------------------------------------------------------------------------- edge lifecycle

    /// Record that `sub`'s tracked run just read `dep`. Implements the cursor-based edge reuse
    /// protocol: reuse the edge at the cursor if it already targets `dep`, otherwise find and
    /// relocate an existing edge, otherwise allocate a new one — in all cases advancing `sub`'s
    /// cursor so a later call in the same run continues from here.
    pub fn link(&self, dep: NodeId, sub: NodeId) {
        if dep == sub {
            return; // no self-edges
        }
        if !self.is_alive(dep) || !self.is_alive(sub) {
            return;
        }

        let dep_version = self.nodes.borrow()[dep].version;
        let cursor = self.nodes.borrow()[sub].cursor;
        if let Some(cursor_link) = cursor {
            if self.links.borrow()[cursor_link].dep == dep {
                // Already in the right place; just record the observed version and advance.
                self.links.borrow_mut()[cursor_link].dep_version_seen = dep_version;
                let next = self.links.borrow()[cursor_link].next_in_sub_deps;
                self.nodes.borrow_mut()[sub].cursor = next;
                return;
            }
        }

        // Search the remainder of sub's deps list (from the cursor onward) for an existing edge
        // to `dep`.
        let mut probe = cursor;
        let mut found = None;
        while let Some(link_id) = probe {
            if self.links.borrow()[link_id].dep == dep {
                found = Some(link_id);
                break;
            }
            probe = self.links.borrow()[link_id].next_in_sub_deps;
        }

        let link_id = if let Some(link_id) = found {
            // Relocate: pull it out of its current spot in sub's deps list...
            self.unlink_from_sub_deps(link_id);
            link_id
        } else {
            // Allocate a new edge and splice it into dep's subs list (position there doesn't
            // matter; append at the tail).
            let link_id = self.links.borrow_mut().insert(Link {
                dep,
                sub,
                prev_in_dep_subs: None,
                next_in_dep_subs: None,
                prev_in_sub_deps: None,
                next_in_sub_deps: None,
                dep_version_seen: dep_version,
            });
            self.push_dep_subs_tail(dep, link_id);
            link_id
        };

        self.links.borrow_mut()[link_id].dep_version_seen = dep_version;
        // ...and (re)insert it at the cursor position in sub's deps list.
        self.insert_sub_deps_before(sub, cursor, link_id);
        let next = self.links.borrow()[link_id].next_in_sub_deps;
        self.nodes.borrow_mut()[sub].cursor = next;
    }

    /// Begin a tracked run of `node`: set it as the active subscriber, mark it TRACKING, and
    /// position its cursor at the head of its existing dependency list. Returns the previous
    /// active subscriber, to be restored by [`Runtime::end_tracking`].
    pub fn begin_tracking(&self, node: NodeId) -> Option<NodeId> {
        let prev = self.active_sub.replace(Some(node));
        let mut nodes = self.nodes.borrow_mut();
        if let Some(n) = nodes.get_mut(node) {
            n.flags.insert(NodeFlags::TRACKING);
            n.cursor = n.deps_head;
        }
        prev
    }

    /// End a tracked run of `node`: unlink everything from the cursor onward (edges not
    /// refreshed this run are stale), clear TRACKING, and restore the previous active subscriber.
    pub fn end_tracking(&self, node: NodeId, prev: Option<NodeId>) {
        if self.is_alive(node) {
            let cursor = self.nodes.borrow()[node].cursor;
            let mut stale = Vec::new();
            let mut cur = cursor;
            while let Some(link_id) = cur {
                stale.push(link_id);
                cur = self.links.borrow()[link_id].next_in_sub_deps;
            }
            for link_id in stale {
                self.unlink(link_id);
            }
            if let Some(n) = self.nodes.borrow_mut().get_mut(node) {
                n.flags.remove(NodeFlags::TRACKING);
                n.cursor = None;
            }
        }
        self.active_sub.set(prev);
    }

    /// Fully remove `link_id` from both the dependency's subscriber list and the subscriber's
    /// dependency list, and free its slot. O(1).
    pub fn unlink(&self, link_id: LinkId) {
        self.unlink_from_dep_subs(link_id);
        self.unlink_from_sub_deps(link_id);
        self.links.borrow_mut().remove(link_id);
    }

    fn unlink_all_deps(&self, node: NodeId) {
        let mut links = Vec::new();
        let mut cur = self.nodes.borrow().get(node).and_then(|n| n.deps_head);
        while let Some(link_id) = cur {
            cur = self.links.borrow()[link_id].next_in_sub_deps;
            links.push(link_id);
        }
        for link_id in links {
            self.unlink(link_id);
        }
    }

    fn unlink_all_subs(&self, node: NodeId) {
        let mut links = Vec::new();
        let mut cur = self.nodes.borrow().get(node).and_then(|n| n.subs_head);
        while let Some(link_id) = cur {
            cur = self.links.borrow()[link_id].next_in_dep_subs;
            links.push(link_id);
        }
        for link_id in links {
            self.unlink(link_id);
        }
    }

    // --- intrusive list primitives -----------------------------------------------------------

    fn push_dep_subs_tail(&self, dep: NodeId, link_id: LinkId) {
        let tail = self.nodes.borrow().get(dep).and_then(|n| n.subs_tail);
        self.links.borrow_mut()[link_id].prev_in_dep_subs = tail;
        self.links.borrow_mut()[link_id].next_in_dep_subs = None;
        if let Some(tail) = tail {
            self.links.borrow_mut()[tail].next_in_dep_subs = Some(link_id);
        }
        if let Some(n) = self.nodes.borrow_mut().get_mut(dep) {
            if n.subs_head.is_none() {
                n.subs_head = Some(link_id);
            }
            n.subs_tail = Some(link_id);
        }
    }

    /// Insert `link_id` into `sub`'s deps list immediately before `before` (or at the tail if
    /// `before` is `None`).
    fn insert_sub_deps_before(&self, sub: NodeId, before: Option<LinkId>, link_id: LinkId) {
        let prev = match before {
            Some(before) => self.links.borrow()[before].prev_in_sub_deps,
            None => self.nodes.borrow().get(sub).and_then(|n| n.deps_tail),
        };
        self.links.borrow_mut()[link_id].prev_in_sub_deps = prev;
        self.links.borrow_mut()[link_id].next_in_sub_deps = before;
        if let Some(prev) = prev {
            self.links.borrow_mut()[prev].next_in_sub_deps = Some(link_id);
        }
        if let Some(before) = before {
            self.links.borrow_mut()[before].prev_in_sub_deps = Some(link_id);
        }
        if let Some(n) = self.nodes.borrow_mut().get_mut(sub) {
            if n.deps_head == before {
                n.deps_head = Some(link_id);
            }
            if before.is_none() {
                n.deps_tail = Some(link_id);
            }
        }
    }

    fn unlink_from_dep_subs(&self, link_id: LinkId) {
        let Some((dep, prev, next)) = self.links.borrow().get(link_id).map(|l| {
            (l.dep, l.prev_in_dep_subs, l.next_in_dep_subs)
        }) else {
            return;
        };
        if let Some(prev) = prev {
            self.links.borrow_mut()[prev].next_in_dep_subs = next;
        }
        if let Some(next) = next {
            self.links.borrow_mut()[next].prev_in_dep_subs = prev;
        }
        if let Some(n) = self.nodes.borrow_mut().get_mut(dep) {
            if n.subs_head == Some(link_id) {
                n.subs_head = next;
            }
            if n.subs_tail == Some(link_id) {
                n.subs_tail = prev;
            }
        }
    }

    fn unlink_from_sub_deps(&self, link_id: LinkId) {
        let Some((sub, prev, next)) = self.links.borrow().get(link_id).map(|l| {
            (l.sub, l.prev_in_sub_deps, l.next_in_sub_deps)
        }) else {
            return;
        };
        if let Some(prev) = prev {
            self.links.borrow_mut()[prev].next_in_sub_deps = next;
        }
        if let Some(next) = next {
            self.links.borrow_mut()[next].prev_in_sub_deps = prev;
        }
        if let Some(n) = self.nodes.borrow_mut().get_mut(sub) {
            if n.deps_head == Some(link_id) {
                n.deps_head = next;
            }
            if n.deps_tail == Some(link_id) {
                n.deps_tail = prev;
            }
        }
    }

    // ------------------------------------------------------------------------------- tracking

    pub fn current_tracker(&self) -> Option<NodeId> {
        self.active_sub.get()
    }

    /// Records a tracked read of `dep` against the current active subscriber, if any.
    pub fn track_read(&self, dep: NodeId) {
        if let Some(sub) = self.active_sub.get() {
            self.link(dep, sub);
        }
    }

    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = self.active_sub.replace(None);
        let ret = f();
        self.active_sub.set(prev);
        ret
    }

    pub fn set_active_sub(&self, sub: Option<NodeId>) -> Option<NodeId> {
        self.active_sub.replace(sub)
    }

    pub fn run_in_scope<R>(&self, scope: NodeId, f: impl FnOnce() -> R) -> R {
        let prev = self.active_scope.replace(scope);
        let ret = f();
        self.active_scope.set(prev);
        ret
    }

    // --------------------------------------------------------------------------- recomputation

    /// Runs `node`'s compute/action exactly once, creating/refreshing dependency edges as it
    /// reads other nodes, then retiring anything it stopped reading. Returns whether the stored
    /// value changed (for effects this is always `true`, since there is nothing to compare).
    ///
    /// If `node` is re-entered while already `TRACKING` (a direct cycle through its own compute),
    /// this returns `Ok(false)` immediately rather than recursing — the engine terminates instead
    /// of looping, per the core's cycle-termination policy.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn recompute(&self, node: NodeId) -> Result<bool, Box<dyn Any>> {
        if !self.is_alive(node) {
            return Ok(false);
        }
        if self.flags_of(node).contains(NodeFlags::TRACKING) {
            #[cfg(feature = "trace")]
            tracing::trace!(?node, "cyclic reactive read, terminating without recomputing");
            return Ok(false);
        }

        // Dispose anything a previous run of this node created as a child (matches scope
        // ownership semantics for effects that create nested effects/scopes each run), and run
        // cleanups registered directly against this node before its next run.
        let owned = self
            .with_node_mut(node, |n| std::mem::take(&mut n.owned))
            .unwrap_or_default();
        for child in owned {
            self.dispose(child);
        }
        let cleanups = self
            .with_node_mut(node, |n| std::mem::take(&mut n.cleanups))
            .unwrap_or_default();
        for cb in cleanups {
            self.untrack(cb);
        }

        let mut compute = match self.with_node_mut(node, |n| n.compute.take()) {
            Some(Some(c)) => c,
            _ => return Ok(false),
        };

        let prev_sub = self.begin_tracking(node);
        let prev_scope = self.active_scope.replace(node);
        let mut value = self.with_node_mut(node, |n| n.value.take()).flatten();
        let result = compute(&mut value);
        self.active_scope.set(prev_scope);
        self.with_node_mut(node, |n| n.value = value);
        self.end_tracking(node, prev_sub);

        if self.is_alive(node) {
            self.with_node_mut(node, |n| n.compute = Some(compute));
        }

        match result {
            Ok(changed) => {
                self.with_node_mut(node, |n| {
                    n.flags.remove(NodeFlags::DIRTY | NodeFlags::PENDING)
                });
                if changed {
                    self.bump_version(node);
                }
                Ok(changed)
            }
            Err(err) => {
                // Leave the node DIRTY so a subsequent read retries, per the core's error policy.
                self.with_node_mut(node, |n| {
                    n.flags.insert(NodeFlags::DIRTY);
                    n.flags.remove(NodeFlags::PENDING);
                });
                Err(err)
            }
        }
    }

    /// The check-dirty algorithm: brings `node` up to date, recomputing only if necessary.
    pub fn validate(&self, node: NodeId) -> Result<(), Box<dyn Any>> {
        self.refresh(node).map(|_| ())
    }

    /// Brings `node` up to date and reports whether its stored value actually changed as a
    /// result (as opposed to being re-confirmed unchanged, i.e. glitch-free memoization). Used
    /// both as the public `validate` and, recursively, while walking a PENDING node's
    /// dependencies to decide whether *it* truly needs to recompute.
    fn refresh(&self, node: NodeId) -> Result<bool, Box<dyn Any>> {
        if !self.is_alive(node) {
            return Ok(false);
        }
        let flags = self.flags_of(node);
        if flags.contains(NodeFlags::TRACKING) {
            // Re-entrant refresh of a node currently computing itself: treat as "no new
            // information" to break the cycle rather than recursing forever.
            #[cfg(feature = "trace")]
            tracing::trace!(?node, "cyclic reactive read during refresh, breaking cycle");
            return Ok(false);
        }
        if flags.contains(NodeFlags::DIRTY) {
            return self.recompute(node);
        }
        if !flags.contains(NodeFlags::PENDING) {
            return Ok(false); // CLEAN and already has a cached value.
        }

        // PENDING: walk dependencies, refreshing any derived ones so their `version` is current,
        // then compare each edge's last-observed version against the dependency's version now.
        // This is what actually distinguishes a dependency that changed from one that merely sits
        // in a PENDING node's list (e.g. an unrelated state cell that was never written this
        // round, or an upstream derived that recomputed but landed on an equal value).
        let mut any_dep_changed = false;
        let mut cur = self.with_node(node, |n| n.deps_head).flatten();
        while let Some(link_id) = cur {
            let dep = self.links.borrow()[link_id].dep;
            if self.flags_of(dep).contains(NodeFlags::RECOMPUTED) {
                self.refresh(dep)?;
            }
            let dep_version = self.version_of(dep);
            let seen = self.links.borrow()[link_id].dep_version_seen;
            if dep_version != seen {
                any_dep_changed = true;
            }
            cur = self
                .links
                .borrow()
                .get(link_id)
                .and_then(|l| l.next_in_sub_deps);
        }

        if any_dep_changed {
            self.recompute(node)
        } else {
            self.with_node_mut(node, |n| n.flags.remove(NodeFlags::PENDING));
            Ok(false)
        }
    }

    // --------------------------------------------------------------------------- propagation

    /// Walks `source`'s subscribers, marking derived cells PENDING (recursing into their own
    /// subscribers only the first time) and enqueuing not-yet-notified effects.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn propagate(&self, source: NodeId) {
        #[cfg(feature = "trace")]
        tracing::trace!(?source, "propagating from source");
        let mut cur = self.with_node(source, |n| n.subs_head).flatten();
        while let Some(link_id) = cur {
            let sub = self.links.borrow()[link_id].sub;
            self.propagate_to(sub);
            cur = self.links.borrow().get(link_id).and_then(|l| l.next_in_dep_subs);
        }
    }

    fn propagate_to(&self, sub: NodeId) {
        let Some(flags) = self.with_node(sub, |n| n.flags) else {
            return;
        };
        if flags.contains(NodeFlags::SIDE_EFFECT) {
            if !flags.contains(NodeFlags::NOTIFIED) {
                self.with_node_mut(sub, |n| n.flags.insert(NodeFlags::NOTIFIED));
                self.enqueue_effect(sub);
            }
            return;
        }
        if flags.contains(NodeFlags::RECOMPUTED) {
            if flags.contains(NodeFlags::PENDING) || flags.contains(NodeFlags::DIRTY) {
                // Already informed of uncertainty; its own subscribers were already reached.
                return;
            }
            self.with_node_mut(sub, |n| n.flags.insert(NodeFlags::PENDING));
            self.propagate(sub);
        }
    }

    /// Queues `node` to run during the next flush. Does *not* flush itself: `propagate` may still
    /// be partway through marking `source`'s other subscribers, and flushing here would run this
    /// effect against a graph that is only partially marked (see `propagate_write`/`end_batch`,
    /// which flush once the full mark phase has completed).
    fn enqueue_effect(&self, node: NodeId) {
        self.pending_effects.borrow_mut().push_back(node);
    }

    /// Marks a state cell's dependents PENDING/NOTIFIED. Should be called immediately after
    /// storing a genuinely new value.
    pub fn propagate_write(&self, node: NodeId) {
        self.with_node_mut(node, |n| n.flags.remove(NodeFlags::DIRTY | NodeFlags::PENDING));
        self.propagate(node);
        if self.batch_depth.get() == 0 {
            self.flush();
        }
    }

    // -------------------------------------------------------------------------------- batching

    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    pub fn end_batch(&self) -> Result<(), crate::error::RuntimeError> {
        let depth = self.batch_depth.get();
        if depth == 0 {
            return Err(crate::error::RuntimeError::BatchMismatch);
        }
        self.batch_depth.set(depth - 1);
        if depth - 1 == 0 {
            self.flush();
        }
        Ok(())
    }

    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.start_batch();
        let ret = f();
        let _ = self.end_batch();
        ret
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    // ------------------------------------------------------------------------------ introspection

    #[cfg(debug_assertions)]
    pub fn deps_of(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.with_node(node, |n| n.deps_head).flatten();
        while let Some(link_id) = cur {
            out.push(self.links.borrow()[link_id].dep);
            cur = self.links.borrow().get(link_id).and_then(|l| l.next_in_sub_deps);
        }
        out
    }

    #[cfg(debug_assertions)]
    pub fn subs_of(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.with_node(node, |n| n.subs_head).flatten();
        while let Some(link_id) = cur {
            out.push(self.links.borrow()[link_id].sub);
            cur = self.links.borrow().get(link_id).and_then(|l| l.next_in_dep_subs);
        }
        out
    }

    /// Drains the pending-effect queue FIFO, running each effect that is still alive and still
    /// notified. Effects enqueued while flushing (including by effects run during this very
    /// flush) are appended and drained before this call returns. Errors from one effect do not
    /// stop the others: the error is reported via `trace` (when enabled) and the flush continues.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    fn flush(&self) {
        #[cfg(feature = "trace")]
        tracing::trace!("flushing pending effects");
        while let Some(node) = self.pending_effects.borrow_mut().pop_front() {
            if !self.is_alive(node) {
                continue;
            }
            if !self.flags_of(node).contains(NodeFlags::NOTIFIED) {
                continue; // stopped or already re-run via a nested flush
            }
            self.with_node_mut(node, |n| n.flags.remove(NodeFlags::NOTIFIED));
            if let Err(_err) = self.recompute(node) {
                #[cfg(feature = "trace")]
                tracing::warn!("effect action returned an error; flush continues");
            }
        }
    }
}
