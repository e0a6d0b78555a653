//! Reactive nodes and the edges (links) between them.
//!
//! Every node and every link is stored in an arena owned by the [`Runtime`](crate::runtime::Runtime)
//! and referred to by a [`slotmap`] key. Keys carry a generation counter, so a handle into a
//! disposed slot is detected rather than silently aliasing whatever gets allocated into the same
//! slot next.

use std::any::Any;

use slotmap::new_key_type;

new_key_type! {
    /// Opaque reference to a node (state cell, derived cell, effect or scope) in the graph.
    pub struct NodeId;
}

new_key_type! {
    /// Opaque reference to a single dependency/subscriber edge between two nodes.
    pub(crate) struct LinkId;
}

/// Bit flags encoding both the kind of a node and its current propagation state. These are the
/// sole source of truth the engine consults when deciding how to treat a node; there is no
/// separate virtual dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct NodeFlags(u16);

impl NodeFlags {
    pub const MUTABLE: NodeFlags = NodeFlags(1 << 0);
    pub const WATCHING: NodeFlags = NodeFlags(1 << 1);
    pub const RECOMPUTED: NodeFlags = NodeFlags(1 << 2);
    pub const SIDE_EFFECT: NodeFlags = NodeFlags(1 << 3);
    pub const SCOPE: NodeFlags = NodeFlags(1 << 4);
    pub const TRACKING: NodeFlags = NodeFlags(1 << 5);
    pub const NOTIFIED: NodeFlags = NodeFlags(1 << 6);
    pub const DIRTY: NodeFlags = NodeFlags(1 << 7);
    pub const PENDING: NodeFlags = NodeFlags(1 << 8);

    pub const fn empty() -> Self {
        NodeFlags(0)
    }

    pub const fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }

    /// Raw bits, exposed to collaborator layers via [`crate::node_flags`].
    pub const fn bits(self) -> u32 {
        self.0 as u32
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;
    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// A reactive node. Common storage for state cells, derived cells, effects and scopes; which one
/// a given node is, and what propagation state it is in, is determined entirely by `flags`.
pub(crate) struct Node {
    pub flags: NodeFlags,
    /// First/last edge in this node's dependency list (edges *into* this node as a subscriber).
    pub deps_head: Option<LinkId>,
    pub deps_tail: Option<LinkId>,
    /// First/last edge in this node's subscriber list (edges *out* to nodes depending on this
    /// node).
    pub subs_head: Option<LinkId>,
    pub subs_tail: Option<LinkId>,
    /// During a tracked run of this node, points at the next edge in `deps_head..` that has not
    /// yet been confirmed touched this run. See the edge lifecycle protocol in `runtime.rs`.
    pub cursor: Option<LinkId>,
    /// Current value for a state cell, or cached value for a derived cell. `None` for effects and
    /// scopes.
    pub value: Option<Box<dyn Any>>,
    /// The user-supplied compute/action, type-erased. Returns `Ok(true)` if the stored value
    /// changed (for state/derived cells, compared with the cell's equality; for effects this is
    /// always `true` since there is nothing to compare).
    #[allow(clippy::type_complexity)]
    pub compute: Option<Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> Result<bool, Box<dyn Any>>>>,
    /// Cleanup callbacks registered with `on_cleanup` while this node (or, for a scope, something
    /// created inside it) was active.
    pub cleanups: Vec<Box<dyn FnOnce()>>,
    /// For an effect: the scope that owns it. For a scope: the parent scope, if any.
    pub owner: Option<NodeId>,
    /// For a scope: effects and child scopes created while it was active, in creation order.
    pub owned: Vec<NodeId>,
    /// Bumped every time this node's stored value is *genuinely* replaced (a non-no-op write for
    /// a state cell, a changed recompute for a derived cell). Lets a subscriber's dependency edge
    /// remember "the version I last observed" and compare cheaply during check-dirty, without
    /// re-running equality on boxed values.
    pub version: u32,
    #[cfg(debug_assertions)]
    pub created_at: &'static std::panic::Location<'static>,
}

impl Node {
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn new(flags: NodeFlags, owner: Option<NodeId>) -> Self {
        Node {
            flags,
            deps_head: None,
            deps_tail: None,
            subs_head: None,
            subs_tail: None,
            cursor: None,
            value: None,
            compute: None,
            cleanups: Vec::new(),
            owner,
            owned: Vec::new(),
            version: 0,
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
        }
    }

    pub fn is_state(&self) -> bool {
        self.flags.contains(NodeFlags::MUTABLE)
    }

    pub fn is_derived(&self) -> bool {
        self.flags.contains(NodeFlags::RECOMPUTED)
    }

    pub fn is_effect(&self) -> bool {
        self.flags.contains(NodeFlags::SIDE_EFFECT)
    }

    pub fn is_scope(&self) -> bool {
        self.flags.contains(NodeFlags::SCOPE)
    }

    pub fn has_subscribers(&self) -> bool {
        self.subs_head.is_some()
    }
}

/// One edge: a dependency/subscriber pairing, doubly linked on both endpoints so that it can be
/// unlinked from either side in O(1).
pub(crate) struct Link {
    pub dep: NodeId,
    pub sub: NodeId,
    /// Neighbors of this link within `dep`'s subscriber list.
    pub prev_in_dep_subs: Option<LinkId>,
    pub next_in_dep_subs: Option<LinkId>,
    /// Neighbors of this link within `sub`'s dependency list.
    pub prev_in_sub_deps: Option<LinkId>,
    pub next_in_sub_deps: Option<LinkId>,
    /// `dep`'s `version` the last time `sub` observed it along this edge (set whenever the edge
    /// is (re)confirmed by a tracked read). Used by check-dirty to tell a genuinely changed
    /// dependency from one that merely sits in a PENDING node's dependency list.
    pub dep_version_seen: u32,
}
