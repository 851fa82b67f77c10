//! Replicated sequence store.
//!
//! Content items form a tree keyed by their `origin` (the item that was to
//! their left when they were created). The document order is a pre-order walk
//! of that tree with siblings sorted by descending [`Stamp`], so a fresh insert
//! lands immediately after its origin and concurrent inserts at the same
//! origin are ordered identically on every replica. Deleted items stay in the
//! tree as tombstones and keep anchoring their descendants.
//!
//! Formatting is an overlay: mark ranges anchored on item ids and block
//! attributes keyed by the newline that opens a block, both resolved by
//! last-writer-wins on the operation stamp.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::clock::{ItemId, OpId, Stamp};

/// Inline formatting marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Code,
}

impl Mark {
    pub const ALL: [Mark; 4] = [Mark::Bold, Mark::Italic, Mark::Underline, Mark::Code];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Small bit set of active marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkSet(u8);

impl MarkSet {
    pub fn contains(self, mark: Mark) -> bool {
        self.0 & mark.bit() != 0
    }

    pub fn with(self, mark: Mark, on: bool) -> Self {
        if on {
            Self(self.0 | mark.bit())
        } else {
            Self(self.0 & !mark.bit())
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Mark> {
        Mark::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl FromIterator<Mark> for MarkSet {
    fn from_iter<I: IntoIterator<Item = Mark>>(iter: I) -> Self {
        iter.into_iter().fold(MarkSet::default(), |set, m| set.with(m, true))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

/// Block-level attribute assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockAttr {
    /// Heading level 1-6, `None` for a plain paragraph.
    Heading(Option<u8>),
    Align(Alignment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockAttrKind {
    Heading,
    Align,
}

impl BlockAttr {
    pub fn kind(&self) -> BlockAttrKind {
        match self {
            BlockAttr::Heading(_) => BlockAttrKind::Heading,
            BlockAttr::Align(_) => BlockAttrKind::Align,
        }
    }
}

/// A block is named by the newline item that opens it; `None` is the first block.
pub type BlockId = Option<ItemId>;

/// One replicated character.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub origin: Option<ItemId>,
    pub stamp: Stamp,
    pub ch: char,
    /// Marks in effect where the item was typed.
    pub marks: MarkSet,
    pub deleted: bool,
}

/// A mark change covering the items from `start` to `end` inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkRange {
    pub id: OpId,
    pub stamp: Stamp,
    pub start: ItemId,
    pub end: ItemId,
    pub mark: Mark,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStyle {
    pub heading: Option<u8>,
    pub align: Alignment,
}

/// A visible character with its resolved marks.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleChar {
    pub id: ItemId,
    pub ch: char,
    pub marks: MarkSet,
}

/// Maximal run of characters sharing the same marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    pub marks: MarkSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub style: BlockStyle,
    pub spans: Vec<Span>,
}

impl Block {
    fn new(id: BlockId, style: BlockStyle) -> Self {
        Self {
            id,
            style,
            spans: Vec::new(),
        }
    }

    fn push(&mut self, ch: char, marks: MarkSet) {
        match self.spans.last_mut() {
            Some(span) if span.marks == marks => span.text.push(ch),
            _ => self.spans.push(Span {
                text: ch.to_string(),
                marks,
            }),
        }
    }

    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

type Sibling = (Stamp, ItemId);

/// The sequence CRDT state. Every mutation is idempotent and commutes with
/// every other mutation; the materialized view depends only on the set of
/// items, deletions and overlays present.
#[derive(Debug, Default)]
pub struct SequenceStore {
    items: HashMap<ItemId, Item>,
    /// Children per origin, sorted by descending stamp. `None` is the start sentinel.
    children: HashMap<Option<ItemId>, Vec<Sibling>>,
    /// Deletions that arrived before the item they target.
    pending_deletes: HashSet<ItemId>,
    marks: HashMap<OpId, MarkRange>,
    block_attrs: HashMap<(BlockId, BlockAttrKind), (Stamp, BlockAttr)>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `item` after its origin. Returns false if it was already present.
    ///
    /// An origin that is unknown or tombstoned never makes this fail.
    pub fn insert(&mut self, mut item: Item) -> bool {
        if self.items.contains_key(&item.id) {
            return false;
        }
        if self.pending_deletes.remove(&item.id) {
            item.deleted = true;
        }

        let siblings = self.children.entry(item.origin).or_default();
        let pos = siblings.partition_point(|(stamp, _)| *stamp > item.stamp);
        siblings.insert(pos, (item.stamp, item.id));
        self.items.insert(item.id, item);
        true
    }

    /// Tombstone an item. Returns true only if a visible item became hidden.
    pub fn delete(&mut self, id: ItemId) -> bool {
        match self.items.get_mut(&id) {
            Some(item) if item.deleted => false,
            Some(item) => {
                item.deleted = true;
                true
            }
            None => {
                self.pending_deletes.insert(id);
                false
            }
        }
    }

    pub fn add_mark(&mut self, range: MarkRange) -> bool {
        if self.marks.contains_key(&range.id) {
            return false;
        }
        self.marks.insert(range.id, range);
        true
    }

    /// Last-writer-wins assignment of a block attribute.
    pub fn set_block_attr(&mut self, block: BlockId, stamp: Stamp, attr: BlockAttr) -> bool {
        let key = (block, attr.kind());
        if let Some((current, _)) = self.block_attrs.get(&key) {
            if *current >= stamp {
                return false;
            }
        }
        self.block_attrs.insert(key, (stamp, attr));
        true
    }

    pub fn block_style(&self, block: BlockId) -> BlockStyle {
        let mut style = BlockStyle::default();
        if let Some((_, BlockAttr::Heading(level))) = self.block_attrs.get(&(block, BlockAttrKind::Heading)) {
            style.heading = *level;
        }
        if let Some((_, BlockAttr::Align(align))) = self.block_attrs.get(&(block, BlockAttrKind::Align)) {
            style.align = *align;
        }
        style
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    /// Number of items held, tombstones included.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Every item in document order, tombstones included.
    pub fn walk(&self) -> Walk<'_> {
        Walk::new(self)
    }

    /// Visible characters in document order with resolved marks.
    ///
    /// This is a lazy view over the store; calling it again restarts it.
    pub fn materialize(&self) -> Materialize<'_> {
        Materialize::new(self)
    }

    pub fn text(&self) -> String {
        self.materialize().map(|c| c.ch).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.materialize().count()
    }

    pub fn is_empty(&self) -> bool {
        self.materialize().next().is_none()
    }

    /// Ids of the visible characters at `offset..offset + count`.
    pub fn visible_ids(&self, offset: usize, count: usize) -> Vec<ItemId> {
        self.materialize().skip(offset).take(count).map(|c| c.id).collect()
    }

    /// The visible character at `offset`.
    pub fn char_at(&self, offset: usize) -> Option<VisibleChar> {
        self.materialize().nth(offset)
    }

    /// Block containing the visible position `offset`.
    pub fn block_at(&self, offset: usize) -> BlockId {
        self.materialize()
            .take(offset)
            .filter(|c| c.ch == '\n')
            .last()
            .map(|c| c.id)
    }

    /// Materialized blocks split on newlines, with styled spans.
    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks = vec![Block::new(None, self.block_style(None))];
        for c in self.materialize() {
            if c.ch == '\n' {
                blocks.push(Block::new(Some(c.id), self.block_style(Some(c.id))));
            } else if let Some(block) = blocks.last_mut() {
                block.push(c.ch, c.marks);
            }
        }
        blocks
    }

    /// Ids referenced by formatting overlays; these must outlive compaction.
    pub fn anchors(&self) -> HashSet<ItemId> {
        let mut anchors: HashSet<ItemId> = self
            .marks
            .values()
            .flat_map(|r| [r.start, r.end])
            .collect();
        anchors.extend(self.block_attrs.keys().filter_map(|(block, _)| *block));
        anchors
    }

    pub fn has_children(&self, id: ItemId) -> bool {
        self.children.get(&Some(id)).is_some_and(|c| !c.is_empty())
    }

    /// Physically remove a tombstoned leaf.
    pub fn reclaim(&mut self, id: ItemId) -> bool {
        let origin = match self.items.get(&id) {
            Some(item) if item.deleted && !self.has_children(id) => item.origin,
            _ => return false,
        };
        if let Some(siblings) = self.children.get_mut(&origin) {
            siblings.retain(|(_, sibling)| *sibling != id);
            if siblings.is_empty() {
                self.children.remove(&origin);
            }
        }
        self.children.remove(&Some(id));
        self.items.remove(&id);
        true
    }

    /// Drop a deletion that is waiting for an item that will never arrive.
    pub fn forget_pending_delete(&mut self, id: ItemId) {
        self.pending_deletes.remove(&id);
    }
}

/// Pre-order walk over every item.
///
/// Items whose origin is not present are walked as children of the start
/// sentinel until the origin arrives.
pub struct Walk<'a> {
    store: &'a SequenceStore,
    roots: std::vec::IntoIter<Sibling>,
    stack: Vec<std::slice::Iter<'a, Sibling>>,
}

impl<'a> Walk<'a> {
    fn new(store: &'a SequenceStore) -> Self {
        let mut roots: Vec<Sibling> = store.children.get(&None).cloned().unwrap_or_default();
        let mut orphaned = false;
        for (origin, siblings) in &store.children {
            if let Some(origin) = origin {
                if !store.items.contains_key(origin) {
                    roots.extend(siblings.iter().copied());
                    orphaned = true;
                }
            }
        }
        if orphaned {
            roots.sort_by(|a, b| b.0.cmp(&a.0));
        }

        Self {
            store,
            roots: roots.into_iter(),
            stack: Vec::new(),
        }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<&'a Item> {
        loop {
            let next = match self.stack.last_mut() {
                Some(level) => match level.next() {
                    Some((_, id)) => *id,
                    None => {
                        self.stack.pop();
                        continue;
                    }
                },
                None => self.roots.next()?.1,
            };

            let Some(item) = self.store.items.get(&next) else {
                continue;
            };
            if let Some(children) = self.store.children.get(&Some(next)) {
                self.stack.push(children.iter());
            }
            return Some(item);
        }
    }
}

/// Lazy materialized view: visible characters with their marks resolved.
pub struct Materialize<'a> {
    walk: Walk<'a>,
    starts: HashMap<ItemId, Vec<&'a MarkRange>>,
    ends: HashMap<ItemId, Vec<OpId>>,
    open: Vec<&'a MarkRange>,
    closed_before_open: HashSet<OpId>,
}

impl<'a> Materialize<'a> {
    fn new(store: &'a SequenceStore) -> Self {
        let mut starts: HashMap<ItemId, Vec<&'a MarkRange>> = HashMap::new();
        let mut ends: HashMap<ItemId, Vec<OpId>> = HashMap::new();
        // Ranges stay inert until both anchors have arrived.
        for range in store.marks.values() {
            if store.contains(range.start) && store.contains(range.end) {
                starts.entry(range.start).or_default().push(range);
                ends.entry(range.end).or_default().push(range.id);
            }
        }

        Self {
            walk: store.walk(),
            starts,
            ends,
            open: Vec::new(),
            closed_before_open: HashSet::new(),
        }
    }
}

fn resolve_marks(open: &[&MarkRange], item: &Item) -> MarkSet {
    let mut marks = MarkSet::default();
    for mark in Mark::ALL {
        let mut winner = (item.stamp, item.marks.contains(mark));
        for range in open.iter().filter(|r| r.mark == mark) {
            if range.stamp > winner.0 {
                winner = (range.stamp, range.on);
            }
        }
        marks = marks.with(mark, winner.1);
    }
    marks
}

impl<'a> Iterator for Materialize<'a> {
    type Item = VisibleChar;

    fn next(&mut self) -> Option<VisibleChar> {
        loop {
            let item = self.walk.next()?;

            if let Some(ranges) = self.starts.get(&item.id) {
                for range in ranges {
                    if !self.closed_before_open.contains(&range.id) {
                        self.open.push(*range);
                    }
                }
            }

            let visible = (!item.deleted).then(|| VisibleChar {
                id: item.id,
                ch: item.ch,
                marks: resolve_marks(&self.open, item),
            });

            if let Some(ends) = self.ends.get(&item.id) {
                for id in ends {
                    let before = self.open.len();
                    self.open.retain(|r| r.id != *id);
                    if self.open.len() == before {
                        self.closed_before_open.insert(*id);
                    }
                }
            }

            if visible.is_some() {
                return visible;
            }
        }
    }
}
