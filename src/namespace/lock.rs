//! Per-operation lock stacks for hand-over-hand path traversal.

use super::tree::FileNode;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};

/// One held node lock, read or write.
pub enum PathGuard {
    Read(ArcRwLockReadGuard<RawRwLock, FileNode>),
    Write(ArcRwLockWriteGuard<RawRwLock, FileNode>),
}

impl PathGuard {
    pub fn node(&self) -> &FileNode {
        match self {
            PathGuard::Read(g) => g,
            PathGuard::Write(g) => g,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, PathGuard::Write(_))
    }
}

/// Guards held by one path operation, in acquisition (root-to-leaf) order.
///
/// Guards are released strictly in reverse order, both on explicit
/// [`release`](LockStack::release) and when the stack is dropped on an
/// error path, so the stack is always empty once an operation returns.
pub struct LockStack {
    guards: Vec<PathGuard>,
}

impl LockStack {
    pub fn new() -> Self {
        Self { guards: Vec::new() }
    }

    /// Push a guard, returning its stack index.
    pub fn push(&mut self, guard: PathGuard) -> usize {
        self.guards.push(guard);
        self.guards.len() - 1
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Immutable view of the node behind the guard at `idx`.
    pub fn node(&self, idx: usize) -> &FileNode {
        self.guards[idx].node()
    }

    /// Mutable view of the node behind a write guard.
    ///
    /// Panics if the guard at `idx` is a read guard; callers only pass
    /// indices they acquired with write intent.
    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut FileNode {
        match &mut self.guards[idx] {
            PathGuard::Write(g) => g,
            PathGuard::Read(_) => panic!("node_mut on a read-locked path segment"),
        }
    }

    /// The most recently locked node.
    pub fn terminal(&self) -> Option<&FileNode> {
        self.guards.last().map(|g| g.node())
    }

    /// Release all guards, leaf back to root.
    pub fn release(mut self) {
        while self.guards.pop().is_some() {}
    }
}

impl Default for LockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        // Reverse of acquisition order.
        while self.guards.pop().is_some() {}
    }
}
