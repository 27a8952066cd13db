/*
 * Copyright 2020 Joyent, Inc.
 */

//! Priority ordering over a session's live connections.
//!
//! A deliberately unbalanced binary search tree keyed by each connection's
//! priority weight. The element count equals the number of configured
//! remote links, typically a handful, so no rebalancing is worth its
//! complexity. Links between nodes are indices into a slab arena rather
//! than pointers; freeing a connection from one thread can never leave a
//! dangling edge visible to another.
//!
//! Each node carries a split parent link: `parent_hi` is set when the node
//! hangs off the low side of its parent, `parent_lo` when it hangs off the
//! high side. The in-order successor walk needs only those two fields and
//! no key comparisons.

use std::collections::HashMap;

use crate::conn::ConnId;

pub type NodeId = usize;

#[derive(Clone, Debug)]
struct Node {
    conn: ConnId,
    priority: i64,
    /// Parent whose priority sorts below this node.
    parent_lo: Option<NodeId>,
    /// Parent whose priority sorts above this node.
    parent_hi: Option<NodeId>,
    child_lo: Option<NodeId>,
    child_hi: Option<NodeId>,
}

/// The ordered set of a session's connections, iterated lowest priority
/// first when scheduling fan-out or picking an eviction victim.
pub struct ConnTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    index: HashMap<ConnId, NodeId>,
}

impl ConnTree {
    pub fn new() -> Self {
        ConnTree {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.index.contains_key(&conn)
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("tree node slot is live")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("tree node slot is live")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Insert a connection with its priority. Equal priorities go to the
    /// high side, so equals iterate in insertion order.
    pub fn insert(&mut self, conn: ConnId, priority: i64) {
        debug_assert!(!self.index.contains_key(&conn));
        let id = self.alloc(Node {
            conn,
            priority,
            parent_lo: None,
            parent_hi: None,
            child_lo: None,
            child_hi: None,
        });
        self.index.insert(conn, id);
        let mut current = match self.root {
            Some(root) => root,
            None => {
                self.root = Some(id);
                return;
            }
        };
        loop {
            if priority < self.node(current).priority {
                match self.node(current).child_lo {
                    Some(lo) => current = lo,
                    None => {
                        self.node_mut(id).parent_hi = Some(current);
                        self.node_mut(current).child_lo = Some(id);
                        return;
                    }
                }
            } else {
                match self.node(current).child_hi {
                    Some(hi) => current = hi,
                    None => {
                        self.node_mut(id).parent_lo = Some(current);
                        self.node_mut(current).child_hi = Some(id);
                        return;
                    }
                }
            }
        }
    }

    fn subtree_first(&self, mut current: NodeId) -> NodeId {
        while let Some(lo) = self.node(current).child_lo {
            current = lo;
        }
        current
    }

    fn subtree_last(&self, mut current: NodeId) -> NodeId {
        while let Some(hi) = self.node(current).child_hi {
            current = hi;
        }
        current
    }

    /// Lowest-priority connection.
    pub fn first(&self) -> Option<ConnId> {
        self.root.map(|r| self.node(self.subtree_first(r)).conn)
    }

    /// Highest-priority connection.
    pub fn last(&self) -> Option<ConnId> {
        self.root.map(|r| self.node(self.subtree_last(r)).conn)
    }

    /// In-order successor of `conn`; `first`..`next`* visits the whole
    /// set in non-decreasing priority order.
    pub fn next(&self, conn: ConnId) -> Option<ConnId> {
        let mut current = *self.index.get(&conn)?;
        if let Some(hi) = self.node(current).child_hi {
            return Some(self.node(self.subtree_first(hi)).conn);
        }
        loop {
            let node = self.node(current);
            if let Some(p) = node.parent_hi {
                return Some(self.node(p).conn);
            }
            match node.parent_lo {
                Some(p) => current = p,
                None => return None,
            }
        }
    }

    /// Unlink a connection, relinking parent and children around it.
    /// Three cases: leaf, one child, two children; with two children the
    /// high subtree is reattached under the low subtree's last node.
    pub fn remove(&mut self, conn: ConnId) -> bool {
        let id = match self.index.remove(&conn) {
            Some(id) => id,
            None => return false,
        };
        let node = self.node(id).clone();
        if let Some(p_lo) = node.parent_lo {
            // This node is its parent's high child.
            if let Some(c_lo) = node.child_lo {
                self.node_mut(c_lo).parent_hi = None;
                self.node_mut(c_lo).parent_lo = Some(p_lo);
                self.node_mut(p_lo).child_hi = Some(c_lo);
                if let Some(c_hi) = node.child_hi {
                    let last = self.subtree_last(c_lo);
                    self.node_mut(c_hi).parent_lo = Some(last);
                    self.node_mut(last).child_hi = Some(c_hi);
                }
            } else if let Some(c_hi) = node.child_hi {
                self.node_mut(c_hi).parent_lo = Some(p_lo);
                self.node_mut(p_lo).child_hi = Some(c_hi);
            } else {
                self.node_mut(p_lo).child_hi = None;
            }
        } else if let Some(p_hi) = node.parent_hi {
            // This node is its parent's low child.
            if let Some(c_lo) = node.child_lo {
                self.node_mut(c_lo).parent_hi = Some(p_hi);
                self.node_mut(p_hi).child_lo = Some(c_lo);
                if let Some(c_hi) = node.child_hi {
                    let last = self.subtree_last(c_lo);
                    self.node_mut(c_hi).parent_lo = Some(last);
                    self.node_mut(last).child_hi = Some(c_hi);
                }
            } else if let Some(c_hi) = node.child_hi {
                self.node_mut(c_hi).parent_hi = Some(p_hi);
                self.node_mut(c_hi).parent_lo = None;
                self.node_mut(p_hi).child_lo = Some(c_hi);
            } else {
                self.node_mut(p_hi).child_lo = None;
            }
        } else {
            // Removing the root.
            if let Some(c_lo) = node.child_lo {
                self.node_mut(c_lo).parent_hi = None;
                self.node_mut(c_lo).parent_lo = None;
                if let Some(c_hi) = node.child_hi {
                    let last = self.subtree_last(c_lo);
                    self.node_mut(c_hi).parent_lo = Some(last);
                    self.node_mut(last).child_hi = Some(c_hi);
                }
                self.root = Some(c_lo);
            } else if let Some(c_hi) = node.child_hi {
                self.node_mut(c_hi).parent_lo = None;
                self.root = Some(c_hi);
            } else {
                self.root = None;
            }
        }
        self.nodes[id] = None;
        self.free.push(id);
        true
    }

    pub fn priority_of(&self, conn: ConnId) -> Option<i64> {
        self.index.get(&conn).map(|&id| self.node(id).priority)
    }
}

impl Default for ConnTree {
    fn default() -> Self {
        ConnTree::new()
    }
}
