use std::cmp::Ordering;

use super::node::Node;
use super::tree::{child_index, read_value};
use super::PageSource;
use crate::types::{ArborError, PageId, Result};

/// Key/value pair yielded by cursors.
pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Position {
    Unpositioned,
    OnEntry,
    BeforeStart,
    AfterEnd,
}

#[derive(Copy, Clone)]
enum Edge {
    First,
    Last,
}

struct Frame {
    node: Node,
    idx: usize,
}

/// Bidirectional cursor over one snapshot of the tree.
///
/// The cursor keeps the root-to-leaf path of the current entry; moving past
/// the end of a leaf climbs to the nearest ancestor with a further child.
/// `first`, `last` and `seek` may be called at any time to restart it.
pub struct Cursor<'a> {
    src: &'a dyn PageSource,
    root: PageId,
    stack: Vec<Frame>,
    position: Position,
}

impl<'a> Cursor<'a> {
    /// Creates an unpositioned cursor over the tree rooted at `root`.
    pub fn new(src: &'a dyn PageSource, root: PageId) -> Self {
        Self {
            src,
            root,
            stack: Vec::new(),
            position: Position::Unpositioned,
        }
    }

    /// Moves to the smallest key.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        self.reset_to(Edge::First)
    }

    /// Moves to the largest key.
    pub fn last(&mut self) -> Result<Option<Entry>> {
        self.reset_to(Edge::Last)
    }

    /// Moves to `key`, or to the next greater key when it is absent.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.stack.clear();
        if self.root.is_none() {
            self.position = Position::AfterEnd;
            return Ok(None);
        }
        let order = self.src.key_order();
        let mut id = self.root;
        loop {
            let node = self.load(id)?;
            match &node {
                Node::Branch(entries) => {
                    let idx = child_index(entries, key, order);
                    id = entries[idx].child;
                    self.stack.push(Frame { node, idx });
                }
                Node::Leaf(entries) => {
                    let idx = entries
                        .partition_point(|e| order.compare(&e.key, key) == Ordering::Less);
                    let len = entries.len();
                    if idx < len {
                        self.stack.push(Frame { node, idx });
                        self.position = Position::OnEntry;
                        return self.current();
                    }
                    self.stack.push(Frame {
                        node,
                        idx: len - 1,
                    });
                    return self.step(Edge::First);
                }
            }
        }
    }

    /// Moves to `key` and returns its value only on an exact match.
    pub fn seek_exact(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let order = self.src.key_order();
        match self.seek(key)? {
            Some((found, value)) if order.compare(&found, key) == Ordering::Equal => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Advances to the next key. An unpositioned cursor starts at the first key.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Entry>> {
        match self.position {
            Position::Unpositioned | Position::BeforeStart => self.first(),
            Position::AfterEnd => Ok(None),
            Position::OnEntry => self.step(Edge::First),
        }
    }

    /// Steps back to the previous key. An unpositioned cursor starts at the
    /// last key.
    pub fn prev(&mut self) -> Result<Option<Entry>> {
        match self.position {
            Position::Unpositioned | Position::AfterEnd => self.last(),
            Position::BeforeStart => Ok(None),
            Position::OnEntry => self.step(Edge::Last),
        }
    }

    /// Returns the entry under the cursor.
    pub fn current(&self) -> Result<Option<Entry>> {
        if self.position != Position::OnEntry {
            return Ok(None);
        }
        let Some(Frame {
            node: Node::Leaf(entries),
            idx,
        }) = self.stack.last()
        else {
            return Err(ArborError::Corruption("cursor not positioned on a leaf"));
        };
        let entry = &entries[*idx];
        Ok(Some((entry.key.clone(), read_value(self.src, &entry.value)?)))
    }

    fn load(&self, id: PageId) -> Result<Node> {
        let node = self.src.load_node(id)?.into_owned();
        if node.is_empty() {
            return Err(ArborError::Corruption("empty tree node"));
        }
        Ok(node)
    }

    fn reset_to(&mut self, edge: Edge) -> Result<Option<Entry>> {
        self.stack.clear();
        if self.root.is_none() {
            self.position = match edge {
                Edge::First => Position::AfterEnd,
                Edge::Last => Position::BeforeStart,
            };
            return Ok(None);
        }
        self.descend(self.root, edge)?;
        self.position = Position::OnEntry;
        self.current()
    }

    fn descend(&mut self, mut id: PageId, edge: Edge) -> Result<()> {
        loop {
            let node = self.load(id)?;
            let idx = match edge {
                Edge::First => 0,
                Edge::Last => node.len() - 1,
            };
            let child = match &node {
                Node::Branch(entries) => Some(entries[idx].child),
                Node::Leaf(_) => None,
            };
            self.stack.push(Frame { node, idx });
            match child {
                Some(next) => id = next,
                None => return Ok(()),
            }
        }
    }

    /// Moves one entry forwards (`Edge::First`) or backwards (`Edge::Last`).
    fn step(&mut self, direction: Edge) -> Result<Option<Entry>> {
        while let Some(top) = self.stack.last_mut() {
            let moved = match direction {
                Edge::First if top.idx + 1 < top.node.len() => {
                    top.idx += 1;
                    true
                }
                Edge::Last if top.idx > 0 => {
                    top.idx -= 1;
                    true
                }
                _ => false,
            };
            if !moved {
                self.stack.pop();
                continue;
            }
            if let Node::Branch(entries) = &top.node {
                let child = entries[top.idx].child;
                self.descend(child, direction)?;
            }
            self.position = Position::OnEntry;
            return self.current();
        }
        self.position = match direction {
            Edge::First => Position::AfterEnd,
            Edge::Last => Position::BeforeStart,
        };
        Ok(None)
    }
}

/// Forward iterator over a cursor, optionally starting at a key.
pub struct Iter<'a> {
    cursor: Cursor<'a>,
    start: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<'a> Iter<'a> {
    /// Iterates from the first key, or from `start` (inclusive) when given.
    pub fn new(cursor: Cursor<'a>, start: Option<Vec<u8>>) -> Self {
        Self {
            cursor,
            start,
            started: false,
            done: false,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            match self.start.take() {
                Some(key) => self.cursor.seek(&key),
                None => self.cursor.first(),
            }
        };
        match step {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
