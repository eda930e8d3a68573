//! Story timeline engine: per-book beat forests (act → chapter → scene), the
//! restructuring engine that rebuilds them, and the plotline policies around them.
//! Every instruction maps a `Project` snapshot to a new one; nothing here touches
//! disk except the `storage` seam.

pub mod core {
    use crate::hierarchy::HierarchyConfig;
    use crate::tree::{BeatTree, TreeError};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{collections::BTreeMap, collections::BTreeSet, fmt, str::FromStr, sync::Arc};

    /// Title given to synthesized beats.
    pub const PLACEHOLDER_TITLE: &str = "auto";

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BeatId(pub u64);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BookId(pub u64);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LineId(pub u64);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CardId(pub u64);

    impl fmt::Display for BeatId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl fmt::Display for BookId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl fmt::Display for LineId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Scope that owns a beat tree and its lines: one book, or the whole series.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
    )]
    pub enum BookKey {
        Series,
        Book(BookId),
    }

    impl fmt::Display for BookKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Series => f.write_str("series"),
                Self::Book(id) => write!(f, "{id}"),
            }
        }
    }

    impl FromStr for BookKey {
        type Err = TimelineError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s == "series" {
                return Ok(Self::Series);
            }
            s.parse::<u64>()
                .map(|n| Self::Book(BookId(n)))
                .map_err(|_| TimelineError::InvalidKey(s.to_string()))
        }
    }

    /* ------------------------------ Settings ------------------------------ */

    /// How the timeline is rendered. Stacked shows every level at once and
    /// therefore requires every top-level branch to reach the same depth.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TimelineView {
        #[default]
        Default,
        Tabbed,
        Stacked,
    }

    impl TimelineView {
        pub fn is_stacked(self) -> bool {
            matches!(self, Self::Stacked)
        }
    }

    /// Project-wide settings that influence instruction semantics.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProjectSettings {
        /// Book that book-less instructions (restructure, hierarchy, line reorder) act on.
        #[serde(default = "ProjectSettings::default_book")]
        pub current_book: BookKey,

        #[serde(default)]
        pub timeline_view: TimelineView,
    }

    impl Default for ProjectSettings {
        fn default() -> Self {
            Self {
                current_book: Self::default_book(),
                timeline_view: TimelineView::default(),
            }
        }
    }

    impl ProjectSettings {
        fn default_book() -> BookKey {
            BookKey::Book(BookId(1))
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A node of a book's timeline tree. The parent is not stored here; it is
    /// derived from the tree's child lists.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Beat {
        pub id: BeatId,
        /// Index among siblings, contiguous from 0.
        pub position: usize,
        #[serde(default)]
        pub title: String,
        #[serde(default)]
        pub time: i64,
        #[serde(default)]
        pub auto_outline_sort: bool,
        #[serde(default)]
        pub expanded: bool,
        #[serde(default)]
        pub from_template_id: Option<String>,
    }

    impl Beat {
        pub fn new(id: BeatId, position: usize, title: impl Into<String>) -> Self {
            Self {
                id,
                position,
                title: title.into(),
                time: 0,
                auto_outline_sort: false,
                expanded: true,
                from_template_id: None,
            }
        }

        /// Filler beat synthesized to keep depths contiguous.
        pub fn placeholder(id: BeatId, position: usize) -> Self {
            Self {
                auto_outline_sort: true,
                ..Self::new(id, position, PLACEHOLDER_TITLE)
            }
        }
    }

    /// A plotline: a horizontal thread of cards across a book's beats.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Line {
        pub id: LineId,
        pub book_id: BookKey,
        #[serde(default)]
        pub title: String,
        #[serde(default)]
        pub color: Option<String>,
        pub position: usize,
        #[serde(default)]
        pub is_pinned: bool,
    }

    /// A card sits where a line crosses a beat.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Card {
        pub id: CardId,
        pub line_id: LineId,
        pub beat_id: BeatId,
        /// Order among the cards sharing this (line, beat) cell.
        #[serde(default)]
        pub position_within_line: usize,
        #[serde(default)]
        pub title: String,
        #[serde(default)]
        pub description: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Book {
        pub id: BookId,
        #[serde(default)]
        pub title: String,
        #[serde(default)]
        pub hierarchy: HierarchyConfig,
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: everything the timeline instructions read and write.
    ///
    /// Trees are shared through `Arc` so that a new snapshot only copies the
    /// trees an instruction actually changes.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Project {
        #[serde(default)]
        pub books: IndexMap<BookId, Book>,
        /// Level configuration of the series-wide timeline.
        #[serde(default)]
        pub series_hierarchy: HierarchyConfig,
        #[serde(default)]
        pub beats: BTreeMap<BookKey, Arc<BeatTree>>,
        #[serde(default)]
        pub lines: Vec<Line>,
        #[serde(default)]
        pub cards: Vec<Card>,
        #[serde(default)]
        pub settings: ProjectSettings,
    }

    impl Project {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn book_exists(&self, book: BookKey) -> bool {
            match book {
                BookKey::Series => true,
                BookKey::Book(id) => self.books.contains_key(&id),
            }
        }

        pub fn hierarchy(&self, book: BookKey) -> Option<&HierarchyConfig> {
            match book {
                BookKey::Series => Some(&self.series_hierarchy),
                BookKey::Book(id) => self.books.get(&id).map(|b| &b.hierarchy),
            }
        }

        pub fn hierarchy_mut(&mut self, book: BookKey) -> Option<&mut HierarchyConfig> {
            match book {
                BookKey::Series => Some(&mut self.series_hierarchy),
                BookKey::Book(id) => self.books.get_mut(&id).map(|b| &mut b.hierarchy),
            }
        }

        pub fn tree(&self, book: BookKey) -> Option<&BeatTree> {
            self.beats.get(&book).map(Arc::as_ref)
        }

        /// Copy-on-write access: clones the tree only if another snapshot shares it.
        pub fn tree_mut(&mut self, book: BookKey) -> Option<&mut BeatTree> {
            self.beats.get_mut(&book).map(Arc::make_mut)
        }

        pub fn line(&self, id: LineId) -> Option<&Line> {
            self.lines.iter().find(|l| l.id == id)
        }

        pub fn line_ids_in(&self, book: BookKey) -> BTreeSet<LineId> {
            self.lines
                .iter()
                .filter(|l| l.book_id == book)
                .map(|l| l.id)
                .collect()
        }

        pub fn next_line_id(&self) -> LineId {
            LineId(self.lines.iter().map(|l| l.id.0).max().unwrap_or(0) + 1)
        }

        pub fn next_card_id(&self) -> CardId {
            CardId(self.cards.iter().map(|c| c.id.0).max().unwrap_or(0) + 1)
        }

        pub fn next_book_id(&self) -> BookId {
            BookId(self.books.keys().map(|id| id.0).max().unwrap_or(0) + 1)
        }

        /// Adds a book with the default single-level hierarchy and an empty tree.
        pub fn add_book(&mut self, title: impl Into<String>) -> BookId {
            let id = self.next_book_id();
            self.books.insert(
                id,
                Book {
                    id,
                    title: title.into(),
                    hierarchy: HierarchyConfig::default(),
                },
            );
            self.beats
                .insert(BookKey::Book(id), Arc::new(BeatTree::new()));
            id
        }

        /// Drops a book together with its tree, lines and their cards.
        pub fn remove_book(&mut self, id: BookId) -> Result<(), TimelineError> {
            if self.books.shift_remove(&id).is_none() {
                return Err(TimelineError::BookNotFound(BookKey::Book(id)));
            }
            let key = BookKey::Book(id);
            self.beats.remove(&key);
            let doomed = self.line_ids_in(key);
            self.lines.retain(|l| l.book_id != key);
            self.cards.retain(|c| !doomed.contains(&c.line_id));
            if self.settings.current_book == key {
                self.settings.current_book = self
                    .books
                    .keys()
                    .next()
                    .map_or(BookKey::Series, |id| BookKey::Book(*id));
            }
            Ok(())
        }

        /// Checks every tree's structural invariants and that it belongs to a known scope.
        pub fn validate(&self) -> Result<(), TimelineError> {
            for (book, tree) in &self.beats {
                if !self.book_exists(*book) {
                    return Err(TimelineError::BookNotFound(*book));
                }
                tree.validate()?;
            }
            Ok(())
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Reasons an instruction is rejected. A rejected instruction never changes state.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TimelineError {
        #[error("book {0} not found")]
        BookNotFound(BookKey),
        #[error("beat {0} not found")]
        BeatNotFound(BeatId),
        #[error("line {0} not found")]
        LineNotFound(LineId),
        #[error("no line at position {0}")]
        LinePositionNotFound(usize),
        #[error("a hierarchy needs 1 to 3 levels, got {0}")]
        LevelCount(usize),
        #[error("hierarchy mismatch: {from_levels} levels cannot map onto {to_levels}")]
        HierarchyMismatch { from_levels: usize, to_levels: usize },
        #[error("line already belongs to {0}")]
        SameBook(BookKey),
        #[error("pinned and unpinned lines cannot be reordered into each other")]
        PinBoundary,
        #[error("{beats} beats paired with {depths} depths")]
        LengthMismatch { beats: usize, depths: usize },
        #[error("depth {depth} is deeper than the deepest level ({max})")]
        DepthOutOfRange { depth: usize, max: usize },
        #[error("beat {0} is listed more than once")]
        DuplicateBeat(BeatId),
        #[error("invalid key {0:?}")]
        InvalidKey(String),
        #[error(transparent)]
        Tree(#[from] TreeError),
    }
}

pub mod tree {
    //! Ordered beat forest for a single book.
    //!
    //! Beats live in `index`; structure lives only in `children`, a side map from
    //! parent slot to the ordered child ids. A beat never stores its parent, so
    //! the tree is acyclic by construction and trivially cloneable.
    //!
    //! Every mutating method validates first and either applies completely or
    //! returns a [`TreeError`] with the tree untouched.

    use crate::core::{Beat, BeatId, TimelineError};
    use serde::{Deserialize, Serialize};
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{
        collections::{BTreeMap, BTreeSet},
        fmt,
        str::FromStr,
    };

    /// Deepest depth a beat may sit at (act = 0, chapter = 1, scene = 2).
    pub const MAX_DEPTH: usize = 2;
    /// Number of levels a book hierarchy may configure.
    pub const MAX_LEVELS: usize = MAX_DEPTH + 1;

    /// Key of a child list: the top level, or a beat.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
    )]
    pub enum ParentKey {
        Root,
        Beat(BeatId),
    }

    impl ParentKey {
        pub fn beat(self) -> Option<BeatId> {
            match self {
                Self::Root => None,
                Self::Beat(id) => Some(id),
            }
        }
    }

    impl From<Option<BeatId>> for ParentKey {
        fn from(parent: Option<BeatId>) -> Self {
            parent.map_or(Self::Root, Self::Beat)
        }
    }

    impl fmt::Display for ParentKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Root => f.write_str("root"),
                Self::Beat(id) => write!(f, "{id}"),
            }
        }
    }

    impl FromStr for ParentKey {
        type Err = TimelineError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s == "root" {
                return Ok(Self::Root);
            }
            s.parse::<u64>()
                .map(|n| Self::Beat(BeatId(n)))
                .map_err(|_| TimelineError::InvalidKey(s.to_string()))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TreeError {
        #[error("beat {0} not found")]
        NotFound(BeatId),
        #[error("beat {0} already exists")]
        Duplicate(BeatId),
        #[error("position {got} does not match the next free position {expected}")]
        PositionMismatch { expected: usize, got: usize },
        #[error("depth {0} exceeds the maximum depth of {max}", max = MAX_DEPTH)]
        TooDeep(usize),
        #[error("beat {0} cannot be moved under its own subtree")]
        Cycle(BeatId),
        #[error("invariant violated: {0}")]
        Invariant(String),
    }

    /// Per-book forest store.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BeatTree {
        index: BTreeMap<BeatId, Beat>,
        children: BTreeMap<ParentKey, Vec<BeatId>>,
        /// Next id to mint. Only ever grows, so deleted ids are never reused.
        heap: u64,
    }

    impl Default for BeatTree {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BeatTree {
        pub fn new() -> Self {
            Self::seeded(1)
        }

        /// Empty tree whose first minted id is `heap` (at least 1).
        pub fn seeded(heap: u64) -> Self {
            let mut children = BTreeMap::new();
            children.insert(ParentKey::Root, Vec::new());
            Self {
                index: BTreeMap::new(),
                children,
                heap: heap.max(1),
            }
        }

        /* ------------------------------ Accessors ------------------------------ */

        pub fn heap(&self) -> u64 {
            self.heap
        }

        pub fn index(&self) -> &BTreeMap<BeatId, Beat> {
            &self.index
        }

        pub fn children(&self) -> &BTreeMap<ParentKey, Vec<BeatId>> {
            &self.children
        }

        pub fn len(&self) -> usize {
            self.index.len()
        }

        pub fn is_empty(&self) -> bool {
            self.index.is_empty()
        }

        pub fn contains(&self, id: BeatId) -> bool {
            self.index.contains_key(&id)
        }

        pub fn find_node(&self, id: BeatId) -> Option<&Beat> {
            self.index.get(&id)
        }

        pub fn children_of(&self, parent: Option<BeatId>) -> &[BeatId] {
            self.children
                .get(&ParentKey::from(parent))
                .map(Vec::as_slice)
                .unwrap_or(&[])
        }

        /// Parent of `id`; `None` for top-level or unknown beats.
        pub fn node_parent(&self, id: BeatId) -> Option<BeatId> {
            self.children
                .iter()
                .find(|(_, ids)| ids.contains(&id))
                .and_then(|(key, _)| key.beat())
        }

        /// Ancestor hops to the top level; `None` if `id` is unknown.
        pub fn depth(&self, id: BeatId) -> Option<usize> {
            if !self.contains(id) {
                return None;
            }
            let mut depth = 0;
            let mut current = id;
            while let Some(parent) = self.node_parent(current) {
                depth += 1;
                if depth > self.index.len() {
                    return None;
                }
                current = parent;
            }
            Some(depth)
        }

        /// Greatest depth of any beat; `None` is the sentinel for an empty tree.
        pub fn max_depth(&self) -> Option<usize> {
            self.walk().into_iter().map(|(_, depth)| depth).max()
        }

        pub fn next_position(&self, parent: Option<BeatId>) -> usize {
            self.children_of(parent).len()
        }

        /// Depth-first, position-ordered `(id, depth)` pairs.
        pub fn walk(&self) -> Vec<(BeatId, usize)> {
            let mut out = Vec::with_capacity(self.index.len());
            self.walk_into(None, 0, &mut out);
            out
        }

        /// `id` followed by its descendants, in walk order, with absolute depths.
        pub fn subtree(&self, id: BeatId) -> Vec<(BeatId, usize)> {
            let Some(depth) = self.depth(id) else {
                return Vec::new();
            };
            let mut out = vec![(id, depth)];
            self.walk_into(Some(id), depth + 1, &mut out);
            out
        }

        pub fn beats_at_depth(&self, depth: usize) -> Vec<BeatId> {
            self.walk()
                .into_iter()
                .filter(|(_, d)| *d == depth)
                .map(|(id, _)| id)
                .collect()
        }

        /// First descendant of `id` at `leaf_depth` in walk order.
        pub fn first_leaf_descendant(&self, id: BeatId, leaf_depth: usize) -> Option<BeatId> {
            self.subtree(id)
                .into_iter()
                .skip(1)
                .find(|(_, depth)| *depth == leaf_depth)
                .map(|(id, _)| id)
        }

        fn walk_into(&self, parent: Option<BeatId>, depth: usize, out: &mut Vec<(BeatId, usize)>) {
            if depth > self.index.len() {
                return;
            }
            for id in self.children_of(parent) {
                out.push((*id, depth));
                self.walk_into(Some(*id), depth + 1, out);
            }
        }

        /* ------------------------------ Mutation ------------------------------ */

        pub fn mint_id(&mut self) -> BeatId {
            let id = BeatId(self.heap);
            self.heap += 1;
            id
        }

        fn child_depth(&self, parent: Option<BeatId>) -> Result<usize, TreeError> {
            match parent {
                None => Ok(0),
                Some(p) => self.depth(p).map(|d| d + 1).ok_or(TreeError::NotFound(p)),
            }
        }

        /// Appends `beat` as the last child of `parent` (top level for `None`).
        /// `beat.position` must equal [`next_position`](Self::next_position).
        pub fn add_node(&mut self, parent: Option<BeatId>, beat: Beat) -> Result<(), TreeError> {
            if self.contains(beat.id) {
                return Err(TreeError::Duplicate(beat.id));
            }
            let depth = self.child_depth(parent)?;
            if depth > MAX_DEPTH {
                return Err(TreeError::TooDeep(depth));
            }
            let expected = self.next_position(parent);
            if beat.position != expected {
                return Err(TreeError::PositionMismatch {
                    expected,
                    got: beat.position,
                });
            }

            let id = beat.id;
            self.heap = self.heap.max(id.0 + 1);
            self.children
                .entry(ParentKey::from(parent))
                .or_default()
                .push(id);
            self.children.insert(ParentKey::Beat(id), Vec::new());
            self.index.insert(id, beat);
            Ok(())
        }

        /// Appends a placeholder beat with a fresh id under `parent`.
        pub fn add_placeholder(&mut self, parent: Option<BeatId>) -> Result<BeatId, TreeError> {
            let depth = self.child_depth(parent)?;
            if depth > MAX_DEPTH {
                return Err(TreeError::TooDeep(depth));
            }
            let id = self.mint_id();
            let beat = Beat::placeholder(id, self.next_position(parent));
            self.add_node(parent, beat)?;
            Ok(id)
        }

        /// Appends a chain of placeholders under `parent`, one per depth, down to
        /// `leaf_depth`. Returns the chain outermost first; empty if `parent` is
        /// already at or below `leaf_depth`.
        pub fn add_chain(
            &mut self,
            parent: Option<BeatId>,
            leaf_depth: usize,
        ) -> Result<Vec<BeatId>, TreeError> {
            let start = self.child_depth(parent)?;
            if leaf_depth > MAX_DEPTH {
                return Err(TreeError::TooDeep(leaf_depth));
            }
            let mut chain = Vec::new();
            let mut parent = parent;
            for _ in start..=leaf_depth {
                let id = self.add_placeholder(parent)?;
                chain.push(id);
                parent = Some(id);
            }
            Ok(chain)
        }

        /// Inserts a placeholder sibling directly after `reference`. Later
        /// siblings shift one position; appending after the last one does not
        /// touch any existing position.
        pub fn insert_peer(&mut self, reference: BeatId) -> Result<BeatId, TreeError> {
            if !self.contains(reference) {
                return Err(TreeError::NotFound(reference));
            }
            let key = ParentKey::from(self.node_parent(reference));
            let id = self.mint_id();

            let siblings = self.children.entry(key).or_default();
            let slot = siblings
                .iter()
                .position(|s| *s == reference)
                .map_or(siblings.len(), |i| i + 1);
            siblings.insert(slot, id);

            self.children.insert(ParentKey::Beat(id), Vec::new());
            self.index.insert(id, Beat::placeholder(id, slot));
            self.renumber(key);
            Ok(id)
        }

        /// Removes `id` and its descendants, closing the gap among its siblings.
        /// Returns the removed ids in walk order.
        pub fn remove_subtree(&mut self, id: BeatId) -> Result<Vec<BeatId>, TreeError> {
            if !self.contains(id) {
                return Err(TreeError::NotFound(id));
            }
            let removed: Vec<BeatId> = self.subtree(id).into_iter().map(|(b, _)| b).collect();
            let key = ParentKey::from(self.node_parent(id));
            if let Some(siblings) = self.children.get_mut(&key) {
                siblings.retain(|s| *s != id);
            }
            for beat in &removed {
                self.index.remove(beat);
                self.children.remove(&ParentKey::Beat(*beat));
            }
            self.renumber(key);
            Ok(removed)
        }

        /// Moves `id` (with its subtree) under `new_parent` at `position`
        /// (clamped to the end). Both sibling groups are renumbered.
        pub fn move_node(
            &mut self,
            id: BeatId,
            new_parent: Option<BeatId>,
            position: usize,
        ) -> Result<(), TreeError> {
            let subtree = self.subtree(id);
            let Some(&(_, old_depth)) = subtree.first() else {
                return Err(TreeError::NotFound(id));
            };
            if let Some(p) = new_parent {
                if subtree.iter().any(|(b, _)| *b == p) {
                    return Err(TreeError::Cycle(id));
                }
            }
            let new_depth = self.child_depth(new_parent)?;
            let height = subtree
                .iter()
                .map(|(_, d)| d - old_depth)
                .max()
                .unwrap_or(0);
            if new_depth + height > MAX_DEPTH {
                return Err(TreeError::TooDeep(new_depth + height));
            }

            let old_key = ParentKey::from(self.node_parent(id));
            if let Some(siblings) = self.children.get_mut(&old_key) {
                siblings.retain(|s| *s != id);
            }
            self.renumber(old_key);

            let new_key = ParentKey::from(new_parent);
            let siblings = self.children.entry(new_key).or_default();
            let slot = position.min(siblings.len());
            siblings.insert(slot, id);
            self.renumber(new_key);
            Ok(())
        }

        /// Edits a beat's payload in place; id and position are preserved.
        pub fn edit_node(&mut self, id: BeatId, edit: impl FnOnce(&mut Beat)) -> Result<(), TreeError> {
            let beat = self.index.get_mut(&id).ok_or(TreeError::NotFound(id))?;
            let (kept_id, kept_position) = (beat.id, beat.position);
            edit(beat);
            beat.id = kept_id;
            beat.position = kept_position;
            Ok(())
        }

        fn renumber(&mut self, key: ParentKey) {
            let Some(ids) = self.children.get(&key) else {
                return;
            };
            for (position, id) in ids.iter().enumerate() {
                if let Some(beat) = self.index.get_mut(id) {
                    beat.position = position;
                }
            }
        }

        /* ----------------------------- Validation ----------------------------- */

        /// Returns the first violated structural invariant, if any.
        pub fn validate(&self) -> Result<(), TreeError> {
            let mut attached = BTreeSet::new();
            for (key, ids) in &self.children {
                if let ParentKey::Beat(parent) = key {
                    if !self.index.contains_key(parent) {
                        return Err(TreeError::Invariant(format!(
                            "child list kept for unknown beat {parent}"
                        )));
                    }
                }
                for (position, id) in ids.iter().enumerate() {
                    let beat = self.index.get(id).ok_or_else(|| {
                        TreeError::Invariant(format!("beat {id} under {key} is not indexed"))
                    })?;
                    if beat.position != position {
                        return Err(TreeError::Invariant(format!(
                            "beat {id} claims position {} but sits at {position} under {key}",
                            beat.position
                        )));
                    }
                    if !attached.insert(*id) {
                        return Err(TreeError::Invariant(format!(
                            "beat {id} has more than one parent"
                        )));
                    }
                    if id.0 >= self.heap {
                        return Err(TreeError::Invariant(format!(
                            "beat {id} is not below the heap {}",
                            self.heap
                        )));
                    }
                }
            }
            if attached.len() != self.index.len() {
                return Err(TreeError::Invariant(format!(
                    "{} indexed beats have no parent slot",
                    self.index.len() - attached.len()
                )));
            }
            let walked = self.walk();
            if walked.len() != self.index.len() {
                return Err(TreeError::Invariant(
                    "some beats are unreachable from the top level".to_string(),
                ));
            }
            if let Some((_, depth)) = walked.iter().find(|(_, depth)| *depth > MAX_DEPTH) {
                return Err(TreeError::TooDeep(*depth));
            }
            Ok(())
        }
    }

}

pub mod hierarchy {
    //! Per-book level configuration (act / chapter / scene) and the policy for
    //! changing how many levels a book has.

    use crate::core::{BeatId, BookKey, Project, TimelineError};
    use crate::restructure::{RebuildOptions, rebuild_tree, relocate_cards};
    use crate::tree::MAX_LEVELS;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, sync::Arc};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum BorderStyle {
        #[default]
        Solid,
        Dashed,
        Dotted,
        None,
    }

    /// Display metadata for one level of the hierarchy.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HierarchyLevel {
        pub name: String,
        /// 0 is the outermost level. Rewritten on every configuration change.
        #[serde(default)]
        pub level: usize,
        #[serde(default = "HierarchyLevel::default_auto_number")]
        pub auto_number: bool,
        #[serde(default)]
        pub text_color: Option<String>,
        #[serde(default)]
        pub text_size: Option<u32>,
        #[serde(default)]
        pub border_color: Option<String>,
        #[serde(default)]
        pub border_style: BorderStyle,
        #[serde(default)]
        pub background_color: Option<String>,
    }

    impl HierarchyLevel {
        pub fn named(name: impl Into<String>, level: usize) -> Self {
            Self {
                name: name.into(),
                level,
                auto_number: true,
                text_color: None,
                text_size: None,
                border_color: None,
                border_style: BorderStyle::default(),
                background_color: None,
            }
        }

        fn default_auto_number() -> bool {
            true
        }
    }

    /// Ordered levels keyed 0 (outermost) to n-1 (innermost), 1 ≤ n ≤ 3.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HierarchyConfig {
        levels: IndexMap<usize, HierarchyLevel>,
    }

    impl Default for HierarchyConfig {
        fn default() -> Self {
            default_levels(1)
        }
    }

    impl HierarchyConfig {
        pub fn from_levels(levels: Vec<HierarchyLevel>) -> Result<Self, TimelineError> {
            if levels.is_empty() || levels.len() > MAX_LEVELS {
                return Err(TimelineError::LevelCount(levels.len()));
            }
            let levels = levels
                .into_iter()
                .enumerate()
                .map(|(index, mut level)| {
                    level.level = index;
                    (index, level)
                })
                .collect();
            Ok(Self { levels })
        }

        pub fn len(&self) -> usize {
            self.levels.len()
        }

        pub fn is_empty(&self) -> bool {
            self.levels.is_empty()
        }

        /// Depth of the innermost level.
        pub fn leaf_depth(&self) -> usize {
            self.levels.len().saturating_sub(1)
        }

        pub fn level(&self, depth: usize) -> Option<&HierarchyLevel> {
            self.levels.get(&depth)
        }

        pub fn level_name(&self, depth: usize) -> &str {
            self.level(depth).map_or("Beat", |l| l.name.as_str())
        }

        pub fn levels(&self) -> impl Iterator<Item = &HierarchyLevel> {
            self.levels.values()
        }
    }

    /// Default level name for `level` in a hierarchy of `count` levels.
    pub fn default_level_name(level: usize, count: usize) -> &'static str {
        match (count, level) {
            (1, _) => "Chapter",
            (_, 0) => "Act",
            (_, 1) => "Chapter",
            _ => "Scene",
        }
    }

    pub fn default_levels(count: usize) -> HierarchyConfig {
        let count = count.clamp(1, MAX_LEVELS);
        HierarchyConfig {
            levels: (0..count)
                .map(|level| {
                    (
                        level,
                        HierarchyLevel::named(default_level_name(level, count), level),
                    )
                })
                .collect(),
        }
    }

    /// Keeps the outermost `count` levels of `current` and appends defaulted
    /// deeper levels. Suitable input for [`set_hierarchy_levels`].
    pub fn resize_levels(current: &HierarchyConfig, count: usize) -> Vec<HierarchyLevel> {
        let mut levels: Vec<HierarchyLevel> = current.levels().take(count).cloned().collect();
        for level in levels.len()..count {
            levels.push(HierarchyLevel::named(
                default_level_name(level, count),
                level,
            ));
        }
        levels
    }

    /// Replaces the current book's levels.
    ///
    /// Same level count: metadata only, beats untouched. Different count: the
    /// book's beats are rebuilt for the new depth. Levels are added and removed
    /// at the deep end:
    /// - deepening pads every branch with placeholders down to the new leaf
    ///   level and moves cards off the former leaves onto their first new leaf;
    /// - shallowing drops beats below the new leaf level and moves their cards
    ///   up to the surviving ancestor.
    pub fn set_hierarchy_levels(
        project: &Project,
        levels: Vec<HierarchyLevel>,
    ) -> Result<Project, TimelineError> {
        let book = project.settings.current_book;
        let mut config = HierarchyConfig::from_levels(levels)?;
        let current = project
            .hierarchy(book)
            .ok_or(TimelineError::BookNotFound(book))?;
        let old_count = current.len();
        let new_count = config.len();

        let mut next = project.clone();
        if old_count != new_count {
            if old_count == 1 && new_count == 2 {
                rename_colliding_leaf(&mut config);
            }
            relevel_beats(&mut next, book, old_count, new_count)?;
            debug!(%book, old_count, new_count, "hierarchy depth changed");
        }
        if let Some(slot) = next.hierarchy_mut(book) {
            *slot = config;
        }
        Ok(next)
    }

    /// One level becoming two: a new inner level defaulted to the outer level's
    /// name becomes "Scene".
    fn rename_colliding_leaf(config: &mut HierarchyConfig) {
        let Some(outer) = config.levels.get(&0).map(|l| l.name.clone()) else {
            return;
        };
        if let Some(inner) = config.levels.get_mut(&1) {
            if inner.name == outer {
                inner.name = "Scene".to_string();
            }
        }
    }

    fn relevel_beats(
        next: &mut Project,
        book: BookKey,
        old_count: usize,
        new_count: usize,
    ) -> Result<(), TimelineError> {
        let new_leaf = new_count - 1;
        let (rebuilt, moves, order) = {
            let Some(tree) = next.tree(book) else {
                return Ok(());
            };
            if tree.is_empty() {
                return Ok(());
            }
            let walked = tree.walk();
            let order: Vec<BeatId> = walked.iter().map(|(id, _)| *id).collect();
            let mut moves = BTreeMap::new();

            let rebuilt = if new_count > old_count {
                let entries: Vec<_> = walked
                    .iter()
                    .filter_map(|(id, depth)| tree.find_node(*id).map(|b| (b.clone(), *depth)))
                    .collect();
                let rebuilt = rebuild_tree(
                    tree.heap(),
                    &entries,
                    RebuildOptions {
                        pad_to: Some(new_leaf),
                    },
                )?;
                for (id, depth) in &walked {
                    if tree.children_of(Some(*id)).is_empty() && *depth < new_leaf {
                        if let Some(leaf) = rebuilt.first_leaf_descendant(*id, new_leaf) {
                            moves.insert(*id, leaf);
                        }
                    }
                }
                rebuilt
            } else {
                let entries: Vec<_> = walked
                    .iter()
                    .filter(|(_, depth)| *depth <= new_leaf)
                    .filter_map(|(id, depth)| tree.find_node(*id).map(|b| (b.clone(), *depth)))
                    .collect();
                for (id, depth) in &walked {
                    if *depth <= new_leaf {
                        continue;
                    }
                    let mut ancestor = *id;
                    for _ in new_leaf..*depth {
                        ancestor = tree.node_parent(ancestor).unwrap_or(ancestor);
                    }
                    moves.insert(*id, ancestor);
                }
                rebuild_tree(tree.heap(), &entries, RebuildOptions::default())?
            };
            (rebuilt, moves, order)
        };

        next.beats.insert(book, Arc::new(rebuilt));
        relocate_cards(next, book, &moves, &order);
        Ok(())
    }

}

pub mod restructure {
    //! Whole-tree rebuilds and the beat insertions that share their padding rules.
    //!
    //! `rebuild_tree` is a single left-to-right pass over `(beat, depth)` entries:
    //! - a missing ancestor level (first entry deeper than 0, or a jump of more
    //!   than one level) is bridged with placeholder beats;
    //! - the parent of an entry at depth `d` following a placed beat at depth `p`
    //!   is found by climbing `p + 1 - d` ancestors from that beat, so a direct
    //!   child climbs 0 and a sibling climbs 1;
    //! - with `pad_to` set, a beat not followed by a deeper entry gets a
    //!   placeholder chain down to `pad_to`.

    use crate::core::{Beat, BeatId, BookKey, LineId, Project, TimelineError};
    use crate::tree::{BeatTree, MAX_DEPTH};
    use std::collections::{BTreeMap, BTreeSet};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RebuildOptions {
        /// Leaf depth every branch is padded down to (stacked view).
        pub pad_to: Option<usize>,
    }

    /// Builds a fresh tree from depth-annotated beats, minting filler ids from
    /// `heap` (raised above every entry id first).
    pub fn rebuild_tree(
        heap: u64,
        entries: &[(Beat, usize)],
        options: RebuildOptions,
    ) -> Result<BeatTree, TimelineError> {
        let floor = entries.iter().map(|(b, _)| b.id.0 + 1).max().unwrap_or(1);
        let mut tree = BeatTree::seeded(heap.max(floor));
        let mut last: Option<(BeatId, usize)> = None;

        for (i, (beat, depth)) in entries.iter().enumerate() {
            let depth = *depth;
            if depth > MAX_DEPTH {
                return Err(TimelineError::DepthOutOfRange {
                    depth,
                    max: MAX_DEPTH,
                });
            }

            let parent = match last {
                Some((prev, prev_depth)) if depth <= prev_depth + 1 => {
                    climb(&tree, prev, prev_depth + 1 - depth)
                }
                Some((prev, _)) => tree.add_chain(Some(prev), depth - 1)?.last().copied(),
                None if depth == 0 => None,
                None => tree.add_chain(None, depth - 1)?.last().copied(),
            };

            let mut node = beat.clone();
            node.position = tree.next_position(parent);
            tree.add_node(parent, node)?;
            last = Some((beat.id, depth));

            if let Some(pad_to) = options.pad_to {
                let deeper_follows = entries.get(i + 1).is_some_and(|(_, d)| *d > depth);
                if !deeper_follows && depth < pad_to {
                    tree.add_chain(Some(beat.id), pad_to)?;
                }
            }
        }
        Ok(tree)
    }

    /// `hops` ancestors up from `from`; `None` once past the top level.
    fn climb(tree: &BeatTree, from: BeatId, hops: usize) -> Option<BeatId> {
        let mut current = Some(from);
        for _ in 0..hops {
            current = current.and_then(|id| tree.node_parent(id));
        }
        current
    }

    /// Rebuilds the current book from a caller-ordered beat list and parallel
    /// target depths.
    ///
    /// The result holds exactly the listed beats (plus fillers). Beats left out
    /// of the list are dropped along with the book's cards on them. In stacked view
    /// branches are padded to the deepest level in play, and cards on former
    /// leaf beats that end up with children follow them to their first leaf.
    pub fn restructure_timeline(
        project: &Project,
        flat_beats: &[Beat],
        depths: &[usize],
    ) -> Result<Project, TimelineError> {
        let book = project.settings.current_book;
        let hierarchy = project
            .hierarchy(book)
            .ok_or(TimelineError::BookNotFound(book))?;
        if flat_beats.len() != depths.len() {
            return Err(TimelineError::LengthMismatch {
                beats: flat_beats.len(),
                depths: depths.len(),
            });
        }
        let empty = BeatTree::new();
        let tree = project.tree(book).unwrap_or(&empty);

        let max = hierarchy.leaf_depth();
        if let Some(depth) = depths.iter().copied().find(|d| *d > max) {
            return Err(TimelineError::DepthOutOfRange { depth, max });
        }
        let mut seen = BTreeSet::new();
        for beat in flat_beats {
            if !tree.contains(beat.id) {
                return Err(TimelineError::BeatNotFound(beat.id));
            }
            if !seen.insert(beat.id) {
                return Err(TimelineError::DuplicateBeat(beat.id));
            }
        }
        let dropped: BTreeSet<BeatId> = tree
            .walk()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !seen.contains(id))
            .collect();

        let stacked = project.settings.timeline_view.is_stacked();
        let original_leaf = tree.max_depth();
        let pad_to = stacked.then(|| {
            depths
                .iter()
                .copied()
                .chain(original_leaf)
                .max()
                .unwrap_or(0)
        });

        let entries: Vec<(Beat, usize)> = flat_beats
            .iter()
            .cloned()
            .zip(depths.iter().copied())
            .collect();
        let rebuilt = rebuild_tree(tree.heap(), &entries, RebuildOptions { pad_to })?;

        let mut moves = BTreeMap::new();
        if let (Some(leaf), Some(original_leaf)) = (pad_to, original_leaf) {
            for (beat, depth) in &entries {
                let was_leaf = tree.depth(beat.id) == Some(original_leaf);
                if was_leaf && *depth < leaf {
                    if let Some(target) = rebuilt.first_leaf_descendant(beat.id, leaf) {
                        moves.insert(beat.id, target);
                    }
                }
            }
        }

        debug!(
            %book,
            beats = entries.len(),
            fillers = rebuilt.len() - entries.len(),
            dropped = dropped.len(),
            relocated = moves.len(),
            "timeline restructured"
        );

        let order: Vec<BeatId> = rebuilt.walk().into_iter().map(|(id, _)| id).collect();
        let mut next = project.clone();
        next.beats.insert(book, std::sync::Arc::new(rebuilt));
        if !dropped.is_empty() {
            let lines = next.line_ids_in(book);
            next.cards
                .retain(|c| !(lines.contains(&c.line_id) && dropped.contains(&c.beat_id)));
        }
        relocate_cards(&mut next, book, &moves, &order);
        Ok(next)
    }

    /// Inserts a placeholder sibling right after `reference`. In stacked view
    /// the new beat also gets a placeholder chain down to the tree's deepest
    /// level.
    pub fn insert_beat(
        project: &Project,
        book: BookKey,
        reference: BeatId,
    ) -> Result<Project, TimelineError> {
        let tree = project.tree(book).ok_or(TimelineError::BookNotFound(book))?;
        let depth = tree
            .depth(reference)
            .ok_or(TimelineError::BeatNotFound(reference))?;
        let leaf = tree.max_depth().unwrap_or(depth);
        let stacked = project.settings.timeline_view.is_stacked();

        let mut next = project.clone();
        let tree = next
            .tree_mut(book)
            .ok_or(TimelineError::BookNotFound(book))?;
        let peer = tree.insert_peer(reference)?;
        if stacked && leaf > depth {
            tree.add_chain(Some(peer), leaf)?;
        }
        debug!(%book, %reference, %peer, stacked, "beat inserted");
        Ok(next)
    }

    /// Appends a placeholder beat under `parent` (top level for `None`). In
    /// stacked view it is padded down to the book's leaf level.
    pub fn add_beat(
        project: &Project,
        book: BookKey,
        parent: Option<BeatId>,
    ) -> Result<Project, TimelineError> {
        let leaf = project
            .hierarchy(book)
            .ok_or(TimelineError::BookNotFound(book))?
            .leaf_depth();
        let tree = project.tree(book).ok_or(TimelineError::BookNotFound(book))?;
        let depth = match parent {
            None => 0,
            Some(p) => tree.depth(p).ok_or(TimelineError::BeatNotFound(p))? + 1,
        };
        if depth > leaf {
            return Err(TimelineError::DepthOutOfRange { depth, max: leaf });
        }
        let stacked = project.settings.timeline_view.is_stacked();

        let mut next = project.clone();
        let tree = next
            .tree_mut(book)
            .ok_or(TimelineError::BookNotFound(book))?;
        let id = tree.add_placeholder(parent)?;
        if stacked && leaf > depth {
            tree.add_chain(Some(id), leaf)?;
        }
        Ok(next)
    }

    /// Re-points the book's cards sitting on a key of `moves` to its value.
    /// Moved cards go after the cards already in the target cell, ordered by
    /// their old beat in `order` and then by their old slot.
    pub(crate) fn relocate_cards(
        project: &mut Project,
        book: BookKey,
        moves: &BTreeMap<BeatId, BeatId>,
        order: &[BeatId],
    ) {
        if moves.is_empty() {
            return;
        }
        let lines = project.line_ids_in(book);
        let rank: BTreeMap<BeatId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut moved: Vec<usize> = project
            .cards
            .iter()
            .enumerate()
            .filter(|(_, c)| lines.contains(&c.line_id) && moves.contains_key(&c.beat_id))
            .map(|(i, _)| i)
            .collect();
        moved.sort_by_key(|&i| {
            let card = &project.cards[i];
            (
                card.line_id,
                rank.get(&card.beat_id).copied().unwrap_or(usize::MAX),
                card.position_within_line,
            )
        });

        let mut next_slot: BTreeMap<(LineId, BeatId), usize> = BTreeMap::new();
        for i in moved {
            let line = project.cards[i].line_id;
            let Some(&target) = moves.get(&project.cards[i].beat_id) else {
                continue;
            };
            let cards = &project.cards;
            let slot = next_slot.entry((line, target)).or_insert_with(|| {
                cards
                    .iter()
                    .filter(|c| c.line_id == line && c.beat_id == target)
                    .map(|c| c.position_within_line + 1)
                    .max()
                    .unwrap_or(0)
            });
            let card = &mut project.cards[i];
            card.beat_id = target;
            card.position_within_line = *slot;
            *slot += 1;
        }
    }

}

pub mod beats {
    //! Single-beat edits: delete, drag-reorder, rename, expand/collapse.

    use crate::core::{BeatId, BookKey, Project, TimelineError};
    use std::collections::BTreeSet;
    use tracing::debug;

    /// Removes `beat` with its subtree. Cards on removed beats are deleted. In
    /// stacked view a parent left without children is padded back down to the
    /// book's leaf level.
    pub fn delete_beat(
        project: &Project,
        book: BookKey,
        beat: BeatId,
    ) -> Result<Project, TimelineError> {
        let leaf = project
            .hierarchy(book)
            .ok_or(TimelineError::BookNotFound(book))?
            .leaf_depth();
        let tree = project.tree(book).ok_or(TimelineError::BookNotFound(book))?;
        if !tree.contains(beat) {
            return Err(TimelineError::BeatNotFound(beat));
        }
        let parent = tree.node_parent(beat);
        let stacked = project.settings.timeline_view.is_stacked();

        let mut next = project.clone();
        let tree = next
            .tree_mut(book)
            .ok_or(TimelineError::BookNotFound(book))?;
        let removed: BTreeSet<BeatId> = tree.remove_subtree(beat)?.into_iter().collect();
        if let Some(parent) = parent.filter(|_| stacked) {
            let shallow = tree.depth(parent).is_some_and(|d| d < leaf);
            if shallow && tree.children_of(Some(parent)).is_empty() {
                tree.add_chain(Some(parent), leaf)?;
            }
        }
        let lines = next.line_ids_in(book);
        let before = next.cards.len();
        next.cards
            .retain(|c| !(lines.contains(&c.line_id) && removed.contains(&c.beat_id)));
        debug!(
            %book,
            %beat,
            beats = removed.len(),
            cards = before - next.cards.len(),
            "beat deleted"
        );
        Ok(next)
    }

    /// Drag-reorder: moves `beat` (with its subtree) under `new_parent` at
    /// `position`. The moved subtree must still fit the book's levels.
    pub fn reorder_beats(
        project: &Project,
        book: BookKey,
        beat: BeatId,
        new_parent: Option<BeatId>,
        position: usize,
    ) -> Result<Project, TimelineError> {
        let leaf = project
            .hierarchy(book)
            .ok_or(TimelineError::BookNotFound(book))?
            .leaf_depth();
        let tree = project.tree(book).ok_or(TimelineError::BookNotFound(book))?;
        let subtree = tree.subtree(beat);
        let Some(&(_, old_depth)) = subtree.first() else {
            return Err(TimelineError::BeatNotFound(beat));
        };
        let new_depth = match new_parent {
            None => 0,
            Some(p) => tree.depth(p).ok_or(TimelineError::BeatNotFound(p))? + 1,
        };
        let deepest = subtree
            .iter()
            .map(|(_, d)| new_depth + d - old_depth)
            .max()
            .unwrap_or(new_depth);
        if deepest > leaf {
            return Err(TimelineError::DepthOutOfRange {
                depth: deepest,
                max: leaf,
            });
        }

        let mut next = project.clone();
        next.tree_mut(book)
            .ok_or(TimelineError::BookNotFound(book))?
            .move_node(beat, new_parent, position)?;
        Ok(next)
    }

    pub fn edit_beat_title(
        project: &Project,
        book: BookKey,
        beat: BeatId,
        title: &str,
    ) -> Result<Project, TimelineError> {
        edit(project, book, beat, |b| {
            b.title = title.to_string();
            b.auto_outline_sort = false;
        })
    }

    pub fn set_beat_expanded(
        project: &Project,
        book: BookKey,
        beat: BeatId,
        expanded: bool,
    ) -> Result<Project, TimelineError> {
        edit(project, book, beat, |b| b.expanded = expanded)
    }

    fn edit(
        project: &Project,
        book: BookKey,
        beat: BeatId,
        change: impl FnOnce(&mut crate::core::Beat),
    ) -> Result<Project, TimelineError> {
        let tree = project.tree(book).ok_or(TimelineError::BookNotFound(book))?;
        if !tree.contains(beat) {
            return Err(TimelineError::BeatNotFound(beat));
        }
        let mut next = project.clone();
        next.tree_mut(book)
            .ok_or(TimelineError::BookNotFound(book))?
            .edit_node(beat, change)?;
        Ok(next)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{BookId, TimelineView};
        use crate::test_support::{card, line, project_from_outline};
        use std::sync::Arc;

        const SAMPLE: &str = "* Act 1\n** Chapter 1\n*** Scene 1\n** Chapter 2\n* Act 2\n";

        fn key() -> BookKey {
            BookKey::Book(BookId(1))
        }

        #[test]
        fn delete_drops_subtree_and_its_cards() {
            let mut project = project_from_outline(SAMPLE, 3);
            project.lines.push(line(1, 1, 0, false));
            project.cards.push(card(1, 1, 3, 0));
            project.cards.push(card(2, 1, 5, 0));

            let next = delete_beat(&project, key(), BeatId(2)).expect("accepted");
            let tree = next.tree(key()).unwrap();
            assert!(!tree.contains(BeatId(3)));
            assert_eq!(tree.children_of(Some(BeatId(1))), &[BeatId(4)]);
            assert_eq!(tree.find_node(BeatId(4)).map(|b| b.position), Some(0));
            assert_eq!(next.cards.len(), 1);
            assert_eq!(next.cards[0].beat_id, BeatId(5));
        }

        #[test]
        fn stacked_delete_pads_an_emptied_parent() {
            let mut project = project_from_outline(SAMPLE, 3);
            project.settings.timeline_view = TimelineView::Stacked;

            let next = delete_beat(&project, key(), BeatId(3)).expect("accepted");
            let tree = next.tree(key()).unwrap();
            assert!(tree.validate().is_ok());
            let scenes = tree.children_of(Some(BeatId(2)));
            assert_eq!(scenes, &[BeatId(6)]);
            assert_eq!(tree.depth(BeatId(6)), Some(2));
            assert_eq!(tree.find_node(BeatId(6)).map(|b| b.title.as_str()), Some("auto"));

            // Default view leaves the chapter bare.
            project.settings.timeline_view = TimelineView::Default;
            let next = delete_beat(&project, key(), BeatId(3)).expect("accepted");
            assert!(next.tree(key()).unwrap().children_of(Some(BeatId(2))).is_empty());
        }

        #[test]
        fn deleting_every_top_level_beat_leaves_an_empty_tree() {
            let project = project_from_outline("* Chapter 1\n", 1);
            let next = delete_beat(&project, key(), BeatId(1)).expect("accepted");
            let tree = next.tree(key()).unwrap();
            assert!(tree.is_empty());
            assert!(tree.validate().is_ok());
            assert_eq!(tree.heap(), 2);
        }

        #[test]
        fn reorder_moves_within_the_level_budget() {
            let project = project_from_outline(SAMPLE, 3);
            let next = reorder_beats(&project, key(), BeatId(4), Some(BeatId(5)), 0)
                .expect("accepted");
            let tree = next.tree(key()).unwrap();
            assert_eq!(tree.children_of(Some(BeatId(5))), &[BeatId(4)]);
            assert!(tree.validate().is_ok());

            assert_eq!(
                reorder_beats(&project, key(), BeatId(1), Some(BeatId(5)), 0),
                Err(TimelineError::DepthOutOfRange { depth: 3, max: 2 })
            );
        }

        #[test]
        fn title_edit_leaves_other_books_shared() {
            let mut project = project_from_outline(SAMPLE, 3);
            let other = project.add_book("Book 2");
            let next = edit_beat_title(&project, key(), BeatId(5), "Finale").expect("accepted");
            let tree = next.tree(key()).unwrap();
            assert_eq!(tree.find_node(BeatId(5)).map(|b| b.title.as_str()), Some("Finale"));
            let other = BookKey::Book(other);
            assert!(Arc::ptr_eq(&project.beats[&other], &next.beats[&other]));
        }

        #[test]
        fn collapse_unknown_beat_is_rejected() {
            let project = project_from_outline(SAMPLE, 3);
            assert_eq!(
                set_beat_expanded(&project, key(), BeatId(40), false),
                Err(TimelineError::BeatNotFound(BeatId(40)))
            );
            let next = set_beat_expanded(&project, key(), BeatId(2), false).expect("accepted");
            assert_eq!(
                next.tree(key()).unwrap().find_node(BeatId(2)).map(|b| b.expanded),
                Some(false)
            );
        }
    }
}

pub mod lines {
    //! Plotline ordering. A book's lines form a pinned block (positions
    //! `0..k`) followed by the unpinned block (`k..n`); only the pin toggle
    //! moves a line across that boundary.

    use crate::core::{BookKey, Line, LineId, Project, TimelineError};
    use tracing::debug;

    /// Lines of `book` in position order.
    pub fn lines_in(project: &Project, book: BookKey) -> Vec<&Line> {
        let mut lines: Vec<&Line> = project.lines.iter().filter(|l| l.book_id == book).collect();
        lines.sort_by_key(|l| (l.position, l.id));
        lines
    }

    pub fn pinned_count(project: &Project, book: BookKey) -> usize {
        project
            .lines
            .iter()
            .filter(|l| l.book_id == book && l.is_pinned)
            .count()
    }

    /// Sorts `book`'s lines pinned-first and renumbers them from 0.
    pub fn normalize_positions(project: &mut Project, book: BookKey) {
        let mut order: Vec<(bool, usize, LineId)> = project
            .lines
            .iter()
            .filter(|l| l.book_id == book)
            .map(|l| (!l.is_pinned, l.position, l.id))
            .collect();
        order.sort();
        let ids: Vec<LineId> = order.into_iter().map(|(_, _, id)| id).collect();
        assign_positions(project, &ids);
    }

    fn ordered_ids(project: &Project, book: BookKey) -> Vec<LineId> {
        lines_in(project, book).into_iter().map(|l| l.id).collect()
    }

    fn assign_positions(project: &mut Project, ids: &[LineId]) {
        for (position, id) in ids.iter().enumerate() {
            if let Some(line) = project.lines.iter_mut().find(|l| l.id == *id) {
                line.position = position;
            }
        }
    }

    /// Pins an unpinned line at the end of the pinned block, or unpins a
    /// pinned line to the head of the unpinned block.
    pub fn toggle_pin_plotline(project: &Project, line: LineId) -> Result<Project, TimelineError> {
        let current = project.line(line).ok_or(TimelineError::LineNotFound(line))?;
        let book = current.book_id;
        let pinning = !current.is_pinned;
        let k = pinned_count(project, book);

        let mut next = project.clone();
        let mut ids = ordered_ids(&next, book);
        ids.retain(|id| *id != line);
        let slot = if pinning { k } else { k - 1 };
        ids.insert(slot.min(ids.len()), line);
        if let Some(l) = next.lines.iter_mut().find(|l| l.id == line) {
            l.is_pinned = pinning;
        }
        assign_positions(&mut next, &ids);
        debug!(%line, %book, pinned = pinning, position = slot, "pin toggled");
        Ok(next)
    }

    /// Moves the current book's line at `source_position` to
    /// `target_position`. Both lines must be on the same side of the pin
    /// boundary.
    pub fn reorder_lines(
        project: &Project,
        target_position: usize,
        source_position: usize,
    ) -> Result<Project, TimelineError> {
        let book = project.settings.current_book;
        let lines = lines_in(project, book);
        let find = |position: usize| {
            lines
                .iter()
                .find(|l| l.position == position)
                .copied()
                .ok_or(TimelineError::LinePositionNotFound(position))
        };
        let source = find(source_position)?;
        let target = find(target_position)?;
        if source.is_pinned != target.is_pinned {
            return Err(TimelineError::PinBoundary);
        }

        let moving = source.id;
        let mut ids: Vec<LineId> = lines.iter().map(|l| l.id).collect();
        let mut next = project.clone();
        if source_position != target_position {
            let from = ids.iter().position(|id| *id == moving).unwrap_or(0);
            let to = ids.iter().position(|id| *id == target.id).unwrap_or(0);
            ids.remove(from);
            ids.insert(to, moving);
            assign_positions(&mut next, &ids);
        }
        Ok(next)
    }

    /// Appends an unpinned line to `book`.
    pub fn add_line(project: &Project, book: BookKey, title: &str) -> Result<Project, TimelineError> {
        if !project.book_exists(book) {
            return Err(TimelineError::BookNotFound(book));
        }
        let mut next = project.clone();
        insert_line(&mut next, book, title.to_string(), None, false);
        Ok(next)
    }

    /// Removes a line with its cards and closes the position gap.
    pub fn delete_line(project: &Project, line: LineId) -> Result<Project, TimelineError> {
        let book = project
            .line(line)
            .ok_or(TimelineError::LineNotFound(line))?
            .book_id;
        let mut next = project.clone();
        next.lines.retain(|l| l.id != line);
        next.cards.retain(|c| c.line_id != line);
        normalize_positions(&mut next, book);
        Ok(next)
    }

    /// Adds a line with a fresh id: pinned lines go to the end of the pinned
    /// block, unpinned ones to the end.
    pub(crate) fn insert_line(
        project: &mut Project,
        book: BookKey,
        title: String,
        color: Option<String>,
        pinned: bool,
    ) -> LineId {
        let id = project.next_line_id();
        let mut ids = ordered_ids(project, book);
        let slot = if pinned {
            pinned_count(project, book)
        } else {
            ids.len()
        };
        ids.insert(slot.min(ids.len()), id);
        project.lines.push(Line {
            id,
            book_id: book,
            title,
            color,
            position: slot,
            is_pinned: pinned,
        });
        assign_positions(project, &ids);
        id
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::BookId;
        use crate::test_support::{card, line, project_from_outline};

        fn key() -> BookKey {
            BookKey::Book(BookId(1))
        }

        /// Lines 1 and 2 pinned, 3 and 4 unpinned.
        fn fixture() -> Project {
            let mut project = project_from_outline("* Chapter 1\n", 1);
            project.lines.push(line(1, 1, 0, true));
            project.lines.push(line(2, 1, 1, true));
            project.lines.push(line(3, 1, 2, false));
            project.lines.push(line(4, 1, 3, false));
            project
        }

        fn order(project: &Project) -> Vec<(u64, bool)> {
            lines_in(project, key())
                .into_iter()
                .map(|l| (l.id.0, l.is_pinned))
                .collect()
        }

        #[test]
        fn pinning_appends_to_the_pinned_block() {
            let next = toggle_pin_plotline(&fixture(), LineId(4)).expect("accepted");
            assert_eq!(order(&next), vec![(1, true), (2, true), (4, true), (3, false)]);
            assert_eq!(pinned_count(&next, key()), 3);
        }

        #[test]
        fn unpinning_lands_at_the_head_of_the_unpinned_block() {
            let next = toggle_pin_plotline(&fixture(), LineId(1)).expect("accepted");
            assert_eq!(order(&next), vec![(2, true), (1, false), (3, false), (4, false)]);
            let positions: Vec<_> = lines_in(&next, key()).iter().map(|l| l.position).collect();
            assert_eq!(positions, vec![0, 1, 2, 3]);
        }

        #[test]
        fn reorder_within_a_block() {
            let next = reorder_lines(&fixture(), 2, 3).expect("accepted");
            assert_eq!(order(&next), vec![(1, true), (2, true), (4, false), (3, false)]);
            let next = reorder_lines(&fixture(), 0, 1).expect("accepted");
            assert_eq!(order(&next), vec![(2, true), (1, true), (3, false), (4, false)]);
        }

        #[test]
        fn reorder_across_the_pin_boundary_is_rejected() {
            assert_eq!(reorder_lines(&fixture(), 0, 3), Err(TimelineError::PinBoundary));
            assert_eq!(reorder_lines(&fixture(), 3, 1), Err(TimelineError::PinBoundary));
            assert_eq!(
                reorder_lines(&fixture(), 0, 9),
                Err(TimelineError::LinePositionNotFound(9))
            );
        }

        #[test]
        fn delete_line_drops_cards_and_closes_the_gap() {
            let mut project = fixture();
            project.cards.push(card(1, 2, 1, 0));
            project.cards.push(card(2, 3, 1, 0));
            let next = delete_line(&project, LineId(2)).expect("accepted");
            assert_eq!(order(&next), vec![(1, true), (3, false), (4, false)]);
            assert_eq!(next.cards.len(), 1);
            assert_eq!(next.lines.iter().find(|l| l.id == LineId(3)).map(|l| l.position), Some(1));
        }

        #[test]
        fn add_line_appends_unpinned() {
            let next = add_line(&fixture(), key(), "Romance").expect("accepted");
            let added = lines_in(&next, key()).last().map(|l| (l.id, l.position, l.is_pinned));
            assert_eq!(added, Some((LineId(5), 4, false)));
            assert_eq!(
                add_line(&fixture(), BookKey::Book(BookId(3)), "x"),
                Err(TimelineError::BookNotFound(BookKey::Book(BookId(3))))
            );
        }
    }
}

pub mod transplant {
    //! Moving a plotline and its cards to another book.
    //!
    //! Cards are mapped by ordinal: a card on the i-th beat at depth d (walk
    //! order) of the source lands on the i-th beat at depth d of the
    //! destination. The destination grows trailing top-level branches when it
    //! has too few beats; the source tree is never touched.

    use crate::core::{BeatId, BookKey, LineId, Project, TimelineError};
    use crate::lines::{insert_line, normalize_positions};
    use crate::tree::BeatTree;
    use std::{collections::BTreeMap, sync::Arc};
    use tracing::{debug, warn};

    pub fn move_line(
        project: &Project,
        line: LineId,
        destination: BookKey,
    ) -> Result<Project, TimelineError> {
        let moving = project.line(line).ok_or(TimelineError::LineNotFound(line))?;
        let source = moving.book_id;
        if !project.book_exists(destination) {
            return Err(TimelineError::BookNotFound(destination));
        }
        if source == destination {
            return Err(TimelineError::SameBook(destination));
        }
        let from_levels = project
            .hierarchy(source)
            .ok_or(TimelineError::BookNotFound(source))?
            .len();
        let dest_hierarchy = project
            .hierarchy(destination)
            .ok_or(TimelineError::BookNotFound(destination))?;
        let to_levels = dest_hierarchy.len();
        if from_levels != to_levels {
            return Err(TimelineError::HierarchyMismatch {
                from_levels,
                to_levels,
            });
        }

        let empty = BeatTree::new();
        let source_tree = project.tree(source).unwrap_or(&empty);
        let ordinals = ordinal_index(source_tree);

        // (depth, ordinal) per card, in card order.
        let mut wanted: BTreeMap<usize, usize> = BTreeMap::new();
        let slots: Vec<Option<(usize, usize)>> = project
            .cards
            .iter()
            .filter(|c| c.line_id == line)
            .map(|c| {
                let slot = ordinals.get(&c.beat_id).copied();
                match slot {
                    Some((depth, ordinal)) => {
                        let need = wanted.entry(depth).or_default();
                        *need = (*need).max(ordinal + 1);
                    }
                    None => warn!(card = c.id.0, beat = %c.beat_id, "card beat missing from source tree"),
                }
                slot
            })
            .collect();

        let mut dest = project.tree(destination).cloned().unwrap_or_default();
        let before = dest.len();
        let stacked = project.settings.timeline_view.is_stacked();
        for (&depth, &need) in &wanted {
            let chain_to = if stacked {
                depth.max(dest_hierarchy.leaf_depth())
            } else {
                depth
            };
            while dest.beats_at_depth(depth).len() < need {
                dest.add_chain(None, chain_to)?;
            }
        }
        let grown = dest.len() - before;
        let by_depth: BTreeMap<usize, Vec<BeatId>> = wanted
            .keys()
            .map(|&depth| (depth, dest.beats_at_depth(depth)))
            .collect();

        let mut next = project.clone();
        if grown > 0 || !next.beats.contains_key(&destination) {
            next.beats.insert(destination, Arc::new(dest));
        }
        let new_line = insert_line(
            &mut next,
            destination,
            moving.title.clone(),
            moving.color.clone(),
            moving.is_pinned,
        );

        let mut slots = slots.into_iter();
        for card in next.cards.iter_mut().filter(|c| c.line_id == line) {
            card.line_id = new_line;
            let target = slots
                .next()
                .flatten()
                .and_then(|(depth, ordinal)| by_depth.get(&depth)?.get(ordinal).copied());
            if let Some(target) = target {
                card.beat_id = target;
            }
        }
        next.lines.retain(|l| l.id != line);
        normalize_positions(&mut next, source);

        debug!(%line, %new_line, %source, %destination, grown, "line moved");
        Ok(next)
    }

    /// Beat id → (depth, index among beats at that depth in walk order).
    fn ordinal_index(tree: &BeatTree) -> BTreeMap<BeatId, (usize, usize)> {
        let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
        tree.walk()
            .into_iter()
            .map(|(id, depth)| {
                let counter = seen.entry(depth).or_default();
                let ordinal = *counter;
                *counter += 1;
                (id, (depth, ordinal))
            })
            .collect()
    }

}

pub mod reducer {
    //! The instruction surface. Each [`Instruction`] maps a project snapshot to
    //! the next one; a rejected instruction leaves the snapshot as it was.

    use crate::beats::{delete_beat, edit_beat_title, reorder_beats, set_beat_expanded};
    use crate::core::{Beat, BeatId, BookId, BookKey, LineId, Project, TimelineError, TimelineView};
    use crate::hierarchy::{HierarchyLevel, set_hierarchy_levels};
    use crate::lines::{add_line, delete_line, reorder_lines, toggle_pin_plotline};
    use crate::restructure::{add_beat, insert_beat, restructure_timeline};
    use crate::transplant::move_line;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use tracing::debug;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Instruction {
        InsertBeat {
            book: BookKey,
            reference: BeatId,
        },
        /// Acts on the current book.
        RestructureTimeline {
            flat_beats: Vec<Beat>,
            depths: Vec<usize>,
        },
        MoveLine {
            line: LineId,
            destination: BookKey,
        },
        /// Acts on the current book.
        SetHierarchyLevels {
            levels: Vec<HierarchyLevel>,
        },
        TogglePinPlotline {
            line: LineId,
        },
        /// Acts on the current book.
        ReorderLines {
            target_position: usize,
            source_position: usize,
        },
        AddBeat {
            book: BookKey,
            #[serde(default)]
            parent: Option<BeatId>,
        },
        DeleteBeat {
            book: BookKey,
            beat: BeatId,
        },
        ReorderBeats {
            book: BookKey,
            beat: BeatId,
            #[serde(default)]
            new_parent: Option<BeatId>,
            position: usize,
        },
        EditBeatTitle {
            book: BookKey,
            beat: BeatId,
            title: String,
        },
        ExpandBeat {
            book: BookKey,
            beat: BeatId,
        },
        CollapseBeat {
            book: BookKey,
            beat: BeatId,
        },
        AddLine {
            book: BookKey,
            title: String,
        },
        DeleteLine {
            line: LineId,
        },
        AddBook {
            title: String,
        },
        DeleteBook {
            book: BookId,
        },
        SetTimelineView {
            view: TimelineView,
        },
        SetCurrentBook {
            book: BookKey,
        },
    }

    impl Instruction {
        pub fn name(&self) -> &'static str {
            match self {
                Self::InsertBeat { .. } => "insert_beat",
                Self::RestructureTimeline { .. } => "restructure_timeline",
                Self::MoveLine { .. } => "move_line",
                Self::SetHierarchyLevels { .. } => "set_hierarchy_levels",
                Self::TogglePinPlotline { .. } => "toggle_pin_plotline",
                Self::ReorderLines { .. } => "reorder_lines",
                Self::AddBeat { .. } => "add_beat",
                Self::DeleteBeat { .. } => "delete_beat",
                Self::ReorderBeats { .. } => "reorder_beats",
                Self::EditBeatTitle { .. } => "edit_beat_title",
                Self::ExpandBeat { .. } => "expand_beat",
                Self::CollapseBeat { .. } => "collapse_beat",
                Self::AddLine { .. } => "add_line",
                Self::DeleteLine { .. } => "delete_line",
                Self::AddBook { .. } => "add_book",
                Self::DeleteBook { .. } => "delete_book",
                Self::SetTimelineView { .. } => "set_timeline_view",
                Self::SetCurrentBook { .. } => "set_current_book",
            }
        }
    }

    /// Computes the next snapshot, or the reason the instruction is rejected.
    pub fn try_apply(project: &Project, instruction: &Instruction) -> Result<Project, TimelineError> {
        match instruction {
            Instruction::InsertBeat { book, reference } => insert_beat(project, *book, *reference),
            Instruction::RestructureTimeline { flat_beats, depths } => {
                restructure_timeline(project, flat_beats, depths)
            }
            Instruction::MoveLine { line, destination } => move_line(project, *line, *destination),
            Instruction::SetHierarchyLevels { levels } => {
                set_hierarchy_levels(project, levels.clone())
            }
            Instruction::TogglePinPlotline { line } => toggle_pin_plotline(project, *line),
            Instruction::ReorderLines {
                target_position,
                source_position,
            } => reorder_lines(project, *target_position, *source_position),
            Instruction::AddBeat { book, parent } => add_beat(project, *book, *parent),
            Instruction::DeleteBeat { book, beat } => delete_beat(project, *book, *beat),
            Instruction::ReorderBeats {
                book,
                beat,
                new_parent,
                position,
            } => reorder_beats(project, *book, *beat, *new_parent, *position),
            Instruction::EditBeatTitle { book, beat, title } => {
                edit_beat_title(project, *book, *beat, title)
            }
            Instruction::ExpandBeat { book, beat } => set_beat_expanded(project, *book, *beat, true),
            Instruction::CollapseBeat { book, beat } => {
                set_beat_expanded(project, *book, *beat, false)
            }
            Instruction::AddLine { book, title } => add_line(project, *book, title),
            Instruction::DeleteLine { line } => delete_line(project, *line),
            Instruction::AddBook { title } => {
                let mut next = project.clone();
                next.add_book(title.clone());
                Ok(next)
            }
            Instruction::DeleteBook { book } => {
                let mut next = project.clone();
                next.remove_book(*book)?;
                Ok(next)
            }
            Instruction::SetTimelineView { view } => {
                let mut next = project.clone();
                next.settings.timeline_view = *view;
                Ok(next)
            }
            Instruction::SetCurrentBook { book } => {
                if !project.book_exists(*book) {
                    return Err(TimelineError::BookNotFound(*book));
                }
                let mut next = project.clone();
                next.settings.current_book = *book;
                Ok(next)
            }
        }
    }

    /// Reducer entry point: a rejected instruction returns `project` itself.
    pub fn apply(project: Arc<Project>, instruction: &Instruction) -> Arc<Project> {
        match try_apply(&project, instruction) {
            Ok(next) => {
                debug!(instruction = instruction.name(), "applied");
                Arc::new(next)
            }
            Err(err) => {
                debug!(instruction = instruction.name(), error = %err, "rejected");
                project
            }
        }
    }

    pub fn apply_all<'a>(
        project: Arc<Project>,
        instructions: impl IntoIterator<Item = &'a Instruction>,
    ) -> Arc<Project> {
        instructions.into_iter().fold(project, apply)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::hierarchy::resize_levels;
        use crate::projectors::outline_projector::flat_lists;
        use crate::test_support::{card, line, project_from_outline};
        use crate::tree::MAX_DEPTH;
        use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

        const SAMPLE: &str = "* Act 1\n** Chapter 1\n*** Scene 1\n** Chapter 2\n* Act 2\n";

        fn key() -> BookKey {
            BookKey::Book(BookId(1))
        }

        fn assert_invariants(project: &Project) {
            project.validate().expect("project invariants");
            for tree in project.beats.values() {
                for (id, depth) in tree.walk() {
                    assert!(depth <= MAX_DEPTH);
                    if let Some(parent) = tree.node_parent(id) {
                        assert_eq!(tree.depth(parent), Some(depth - 1));
                    }
                }
            }
        }

        #[test]
        fn rejection_returns_the_same_snapshot() {
            let project = Arc::new(project_from_outline(SAMPLE, 3));
            let cases = [
                Instruction::SetHierarchyLevels { levels: vec![] },
                Instruction::InsertBeat {
                    book: key(),
                    reference: BeatId(99),
                },
                Instruction::RestructureTimeline {
                    flat_beats: vec![],
                    depths: vec![0],
                },
                Instruction::TogglePinPlotline { line: LineId(7) },
                Instruction::SetCurrentBook {
                    book: BookKey::Book(BookId(5)),
                },
            ];
            for instruction in &cases {
                let next = apply(project.clone(), instruction);
                assert!(Arc::ptr_eq(&project, &next), "{}", instruction.name());
            }
        }

        #[test]
        fn move_line_between_mismatched_hierarchies_is_a_no_op() {
            let mut project = project_from_outline(SAMPLE, 3);
            project.add_book("Sequel");
            project.lines.push(line(1, 1, 0, false));
            project.cards.push(card(1, 1, 3, 0));
            let project = Arc::new(project);

            let next = apply(
                project.clone(),
                &Instruction::MoveLine {
                    line: LineId(1),
                    destination: BookKey::Book(BookId(2)),
                },
            );
            assert!(Arc::ptr_eq(&project, &next));
        }

        #[test]
        fn instructions_decode_from_tagged_json() {
            let json = r#"[
                {"type": "insert_beat", "book": "1", "reference": 2},
                {"type": "move_line", "line": 4, "destination": "series"},
                {"type": "reorder_lines", "target_position": 0, "source_position": 1},
                {"type": "set_timeline_view", "view": "stacked"},
                {"type": "add_beat", "book": "series"}
            ]"#;
            let decoded: Vec<Instruction> = serde_json::from_str(json).expect("decode");
            assert_eq!(
                decoded,
                vec![
                    Instruction::InsertBeat {
                        book: key(),
                        reference: BeatId(2)
                    },
                    Instruction::MoveLine {
                        line: LineId(4),
                        destination: BookKey::Series
                    },
                    Instruction::ReorderLines {
                        target_position: 0,
                        source_position: 1
                    },
                    Instruction::SetTimelineView {
                        view: TimelineView::Stacked
                    },
                    Instruction::AddBeat {
                        book: BookKey::Series,
                        parent: None
                    },
                ]
            );
        }

        #[test]
        fn hierarchy_change_through_the_reducer_renames_the_new_level() {
            let project = project_from_outline("* Chapter 1\n", 1);
            let levels = resize_levels(project.hierarchy(key()).unwrap(), 2);
            let next = apply(
                Arc::new(project),
                &Instruction::SetHierarchyLevels { levels },
            );
            let names: Vec<_> = next
                .hierarchy(key())
                .unwrap()
                .levels()
                .map(|l| l.name.clone())
                .collect();
            assert_eq!(names, vec!["Chapter", "Scene"]);
        }

        #[test]
        fn mixed_sequence_keeps_every_tree_valid() {
            let mut project = project_from_outline(SAMPLE, 3);
            project.lines.push(line(1, 1, 0, false));
            project.lines.push(line(2, 1, 1, false));
            project.cards.push(card(1, 1, 3, 0));
            project.cards.push(card(2, 2, 5, 0));

            let steps = vec![
                Instruction::SetTimelineView {
                    view: TimelineView::Stacked,
                },
                Instruction::InsertBeat {
                    book: key(),
                    reference: BeatId(1),
                },
                Instruction::AddBeat {
                    book: key(),
                    parent: None,
                },
                Instruction::TogglePinPlotline { line: LineId(2) },
                Instruction::ReorderBeats {
                    book: key(),
                    beat: BeatId(4),
                    new_parent: Some(BeatId(5)),
                    position: 0,
                },
                Instruction::AddBook {
                    title: "Sequel".to_string(),
                },
                Instruction::DeleteBeat {
                    book: key(),
                    beat: BeatId(2),
                },
                Instruction::EditBeatTitle {
                    book: key(),
                    beat: BeatId(5),
                    title: "Finale".to_string(),
                },
                Instruction::SetTimelineView {
                    view: TimelineView::Default,
                },
                Instruction::MoveLine {
                    line: LineId(1),
                    destination: BookKey::Series,
                },
                Instruction::DeleteBook { book: BookId(2) },
            ];

            let mut current = Arc::new(project);
            for step in &steps {
                current = apply(current, step);
                assert_invariants(&current);
            }
            assert_eq!(current.books.len(), 1);
            assert_eq!(
                current.tree(key()).unwrap().find_node(BeatId(5)).map(|b| b.title.as_str()),
                Some("Finale")
            );
        }

        #[test]
        fn empty_restructure_through_the_reducer_clears_the_book() {
            let project = Arc::new(project_from_outline(SAMPLE, 3));
            let next = apply(
                project.clone(),
                &Instruction::RestructureTimeline {
                    flat_beats: vec![],
                    depths: vec![],
                },
            );
            assert!(!Arc::ptr_eq(&project, &next));
            assert!(next.tree(key()).unwrap().is_empty());
            assert_eq!(project.tree(key()).unwrap().len(), 5);
        }

        #[test]
        fn apply_all_folds_and_skips_rejections() {
            let project = Arc::new(project_from_outline(SAMPLE, 3));
            let steps = [
                Instruction::AddBeat {
                    book: key(),
                    parent: Some(BeatId(4)),
                },
                Instruction::DeleteBeat {
                    book: key(),
                    beat: BeatId(40),
                },
                Instruction::EditBeatTitle {
                    book: key(),
                    beat: BeatId(6),
                    title: "Ambush".to_string(),
                },
            ];
            let next = apply_all(project.clone(), &steps);
            assert!(!Arc::ptr_eq(&project, &next));
            let tree = next.tree(key()).unwrap();
            assert_eq!(tree.children_of(Some(BeatId(4))), &[BeatId(6)]);
            assert_eq!(tree.find_node(BeatId(6)).map(|b| b.title.as_str()), Some("Ambush"));

            let unchanged = apply_all(project.clone(), &steps[1..2]);
            assert!(Arc::ptr_eq(&project, &unchanged));
        }

        fn pick_beat(rng: &mut StdRng, project: &Project, book: BookKey) -> BeatId {
            let ids: Vec<BeatId> = project
                .tree(book)
                .map(|t| t.walk().into_iter().map(|(id, _)| id).collect())
                .unwrap_or_default();
            ids.choose(rng).copied().unwrap_or(BeatId(1))
        }

        fn random_instruction(rng: &mut StdRng, project: &Project) -> Instruction {
            let books = [key(), BookKey::Book(BookId(2)), BookKey::Series];
            let book = *books.choose(rng).unwrap();
            let line = LineId(rng.gen_range(1..=4));
            match rng.gen_range(0..10) {
                0 => Instruction::InsertBeat {
                    book,
                    reference: pick_beat(rng, project, book),
                },
                1 => Instruction::AddBeat {
                    book,
                    parent: rng
                        .gen_bool(0.7)
                        .then(|| pick_beat(rng, project, book)),
                },
                2 => Instruction::DeleteBeat {
                    book,
                    beat: pick_beat(rng, project, book),
                },
                3 => Instruction::ReorderBeats {
                    book,
                    beat: pick_beat(rng, project, book),
                    new_parent: rng
                        .gen_bool(0.6)
                        .then(|| pick_beat(rng, project, book)),
                    position: rng.gen_range(0..3),
                },
                4 => {
                    let current = project.settings.current_book;
                    let leaf = project.hierarchy(current).map_or(0, |h| h.leaf_depth());
                    let (mut flat, _) = project.tree(current).map(flat_lists).unwrap_or_default();
                    flat.shuffle(rng);
                    if rng.gen_bool(0.2) {
                        let keep = rng.gen_range(0..=flat.len());
                        flat.truncate(keep);
                    }
                    let depths = flat.iter().map(|_| rng.gen_range(0..=leaf)).collect();
                    Instruction::RestructureTimeline {
                        flat_beats: flat,
                        depths,
                    }
                }
                5 => Instruction::MoveLine {
                    line,
                    destination: book,
                },
                6 => Instruction::TogglePinPlotline { line },
                7 => {
                    let current = project.settings.current_book;
                    let levels = project
                        .hierarchy(current)
                        .map(|h| resize_levels(h, rng.gen_range(1..=3)))
                        .unwrap_or_default();
                    Instruction::SetHierarchyLevels { levels }
                }
                8 => Instruction::SetTimelineView {
                    view: *[TimelineView::Default, TimelineView::Tabbed, TimelineView::Stacked]
                        .choose(rng)
                        .unwrap(),
                },
                _ => Instruction::SetCurrentBook { book },
            }
        }

        #[test]
        fn random_instruction_streams_keep_every_tree_valid() {
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let mut project = project_from_outline(SAMPLE, 3);
            let sequel = project.add_book("Sequel");
            if let Some(book) = project.books.get_mut(&sequel) {
                book.hierarchy = crate::hierarchy::default_levels(3);
            }
            project.settings.timeline_view = TimelineView::Stacked;
            project.lines.push(line(1, 1, 0, false));
            project.lines.push(line(2, 1, 1, true));
            project.lines.push(line(3, 2, 0, false));
            project.lines.push(line(4, 1, 2, false));
            for (i, beat) in [3, 3, 4, 5, 1, 2].into_iter().enumerate() {
                let id = project.next_card_id();
                project.cards.push(card(id.0, (i % 2) as u64 + 1, beat, i / 2));
            }
            let start = Arc::new(project);
            assert_invariants(&start);

            for _ in 0..16 {
                let mut current = start.clone();
                for _ in 0..40 {
                    let step = random_instruction(&mut rng, &current);
                    current = apply(current, &step);
                    assert_invariants(&current);
                    for (book, tree) in &current.beats {
                        let leaf = current.hierarchy(*book).map_or(0, |h| h.leaf_depth());
                        assert!(
                            tree.max_depth().is_none_or(|d| d <= leaf),
                            "{book} deeper than its levels after {}",
                            step.name()
                        );
                    }
                }
            }
        }

        #[test]
        fn random_permutations_restructure_totally() {
            let mut rng = StdRng::seed_from_u64(0x7157);
            let project = project_from_outline(
                "* Act 1\n** Chapter 1\n*** Scene 1\n*** Scene 2\n** Chapter 2\n* Act 2\n** Chapter 3\n*** Scene 3\n",
                3,
            );
            let (flat, depths) = flat_lists(project.tree(key()).unwrap());

            for _ in 0..64 {
                let mut pairs: Vec<(Beat, usize)> =
                    flat.iter().cloned().zip(depths.iter().copied()).collect();
                pairs.shuffle(&mut rng);
                if rng.gen_bool(0.5) {
                    for pair in pairs.iter_mut() {
                        pair.1 = rng.gen_range(0..=MAX_DEPTH);
                    }
                }
                let (beats, wanted): (Vec<Beat>, Vec<usize>) = pairs.into_iter().unzip();

                let next = try_apply(
                    &project,
                    &Instruction::RestructureTimeline {
                        flat_beats: beats.clone(),
                        depths: wanted,
                    },
                )
                .expect("restructure accepted");
                assert_invariants(&next);

                let tree = next.tree(key()).unwrap();
                let walked = tree.walk();
                for pair in walked.windows(2) {
                    assert!(pair[1].1 <= pair[0].1 + 1, "depth jump in {walked:?}");
                }
                for beat in &beats {
                    assert!(tree.contains(beat.id));
                }
                let fillers = tree.index().values().filter(|b| b.id.0 >= 9);
                assert!(fillers.into_iter().all(|b| b.title == "auto"));
            }
        }
    }
}

pub mod storage {
    use crate::core::Project;
    use crate::parser::ParsedOutline;
    use anyhow::{Context, Result};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Loads and saves whole project snapshots.
    pub trait ProjectRepository {
        /// Read a snapshot and check its structural invariants.
        fn load(&self) -> Result<Project>;

        fn save(&self, project: &Project) -> Result<()>;
    }

    /// Parsing outline text is independent of where projects are stored.
    pub trait OutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<ParsedOutline>;
    }

    /// Pretty-printed JSON file holding one project.
    pub struct JsonProjectRepository {
        path: PathBuf,
    }

    impl JsonProjectRepository {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl ProjectRepository for JsonProjectRepository {
        fn load(&self) -> Result<Project> {
            let text = fs::read_to_string(&self.path)
                .with_context(|| format!("reading {:?}", self.path))?;
            let project: Project = serde_json::from_str(&text)
                .with_context(|| format!("decoding project {:?}", self.path))?;
            project
                .validate()
                .with_context(|| format!("validating project {:?}", self.path))?;
            Ok(project)
        }

        fn save(&self, project: &Project) -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
            let json = serde_json::to_string_pretty(project).context("encoding project")?;
            fs::write(&self.path, json).with_context(|| format!("writing {:?}", self.path))
        }
    }

}

pub mod parser {
    //! Star outline reader built on `nom`.
    //!
    //! One beat per line: `*` act, `**` chapter, `***` scene, then a space and
    //! the title, kept as written. Leading indentation is ignored. Blank lines
    //! and lines starting with `#` are skipped. A level
    //! skipped in the text is bridged with a placeholder beat when the tree is
    //! built.

    use crate::core::{Beat, BeatId, BookId, BookKey, Project};
    use crate::hierarchy::default_levels;
    use crate::restructure::{RebuildOptions, rebuild_tree};
    use crate::storage::OutlineParser;
    use crate::tree::{BeatTree, MAX_LEVELS};
    use anyhow::{Context, Result, anyhow, bail};
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::{not_line_ending, space1},
        combinator::map,
        error::VerboseError,
        sequence::tuple,
    };
    use std::{fs, path::Path, sync::Arc};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OutlineEntry {
        pub depth: usize,
        pub title: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ParsedOutline {
        pub entries: Vec<OutlineEntry>,
    }

    impl ParsedOutline {
        pub fn max_depth(&self) -> Option<usize> {
            self.entries.iter().map(|e| e.depth).max()
        }

        /// Hierarchy levels needed to hold every entry (at least one).
        pub fn level_count(&self) -> usize {
            self.max_depth().map_or(1, |d| d + 1)
        }

        /// Beats numbered 1..=n in reading order, with their depths.
        pub fn beats(&self) -> (Vec<Beat>, Vec<usize>) {
            self.entries
                .iter()
                .enumerate()
                .map(|(i, e)| (Beat::new(BeatId(i as u64 + 1), 0, e.title.clone()), e.depth))
                .unzip()
        }

        pub fn build_tree(&self) -> Result<BeatTree> {
            let (beats, depths) = self.beats();
            let entries: Vec<(Beat, usize)> = beats.into_iter().zip(depths).collect();
            let heap = entries.len() as u64 + 1;
            rebuild_tree(heap, &entries, RebuildOptions::default()).context("building outline tree")
        }

        /// Adds the outline to `project` as a new book whose hierarchy has as
        /// many levels as the outline uses.
        pub fn add_to_project(&self, project: &mut Project, title: &str) -> Result<BookId> {
            let tree = self.build_tree()?;
            let id = project.add_book(title);
            if let Some(book) = project.books.get_mut(&id) {
                book.hierarchy = default_levels(self.level_count());
            }
            project.beats.insert(BookKey::Book(id), Arc::new(tree));
            Ok(id)
        }
    }

    /// Parse an outline document from a string.
    pub fn parse_outline_from_str(input: &str) -> Result<ParsedOutline> {
        let mut outline = ParsedOutline::default();
        for (n, raw) in input.lines().enumerate() {
            let text = raw.trim_start();
            if text.trim_end().is_empty() || text.starts_with('#') {
                continue;
            }
            let (_, (stars, title)) = heading(text).map_err(to_anyhow(n + 1))?;
            if stars > MAX_LEVELS {
                bail!("line {}: {} stars, at most {} levels are supported", n + 1, stars, MAX_LEVELS);
            }
            outline.entries.push(OutlineEntry {
                depth: stars - 1,
                title: title.to_string(),
            });
        }
        Ok(outline)
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct StarOutlineParser;

    impl OutlineParser for StarOutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<ParsedOutline> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            parse_outline_from_str(&text).with_context(|| format!("parsing {:?}", abs_path))
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn heading(i: &str) -> PResult<'_, (usize, &str)> {
        map(
            tuple((take_while1(|c: char| c == '*'), space1, not_line_ending)),
            |(stars, _, title): (&str, &str, &str)| (stars.len(), title),
        )(i)
    }

    fn to_anyhow(line: usize) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let at = ve.errors.first().map(|(frag, _)| *frag).unwrap_or_default();
                anyhow!("line {line}: expected `* title`, found {at:?}")
            }
            nom::Err::Incomplete(_) => anyhow!("line {line}: incomplete heading"),
        }
    }

}

pub mod format {
    use crate::projectors::outline_projector::{OutlineRow, flatten};
    use crate::tree::BeatTree;

    /// Renders a tree as a star outline that [`crate::parse_outline_from_str`]
    /// reads back into the same shape.
    pub fn format_outline(tree: &BeatTree) -> String {
        let mut out = String::new();
        for row in flatten(tree) {
            out.push_str(&"*".repeat(row.depth + 1));
            out.push(' ');
            out.push_str(&row.beat.title);
            out.push('\n');
        }
        out
    }

    /// Indented listing of projected rows, one per line.
    pub fn format_rows(rows: &[OutlineRow]) -> String {
        let mut out = String::new();
        for row in rows {
            out.push_str(&"  ".repeat(row.depth));
            out.push_str(&row.level);
            out.push_str(": ");
            out.push_str(&row.title);
            match row.card_count {
                0 => {}
                1 => out.push_str(" (1 card)"),
                n => out.push_str(&format!(" ({n} cards)")),
            }
            out.push('\n');
        }
        out
    }

}

pub mod projectors {
    pub mod outline_projector {
        //! Read-only, depth-first views of a beat tree for rendering and export.
        //! Rows carry depth and order, never ids.

        use crate::core::{Beat, BookKey, PLACEHOLDER_TITLE, Project, TimelineError};
        use crate::hierarchy::HierarchyConfig;
        use crate::tree::BeatTree;
        use serde::Serialize;
        use std::collections::BTreeMap;

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct FlatBeat<'a> {
            pub beat: &'a Beat,
            pub depth: usize,
        }

        /// Depth-first, position-ordered beats with their computed depth.
        pub fn flatten(tree: &BeatTree) -> Vec<FlatBeat<'_>> {
            tree.walk()
                .into_iter()
                .filter_map(|(id, depth)| tree.find_node(id).map(|beat| FlatBeat { beat, depth }))
                .collect()
        }

        /// The flattening as the parallel lists a restructure consumes.
        pub fn flat_lists(tree: &BeatTree) -> (Vec<Beat>, Vec<usize>) {
            flatten(tree)
                .into_iter()
                .map(|f| (f.beat.clone(), f.depth))
                .unzip()
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct OutlineRow {
            pub depth: usize,
            /// Hierarchy level name, e.g. "Chapter".
            pub level: String,
            pub title: String,
            pub card_count: usize,
            /// Display titles of the ancestors, outermost first.
            pub context_path: Vec<String>,
        }

        /// Rows for one book, enriched with level names and card counts.
        pub fn project_book(project: &Project, book: BookKey) -> Result<Vec<OutlineRow>, TimelineError> {
            let hierarchy = project
                .hierarchy(book)
                .ok_or(TimelineError::BookNotFound(book))?;
            let Some(tree) = project.tree(book) else {
                return Ok(Vec::new());
            };

            let lines = project.line_ids_in(book);
            let mut cards: BTreeMap<_, usize> = BTreeMap::new();
            for card in project.cards.iter().filter(|c| lines.contains(&c.line_id)) {
                *cards.entry(card.beat_id).or_default() += 1;
            }

            let mut ordinals: BTreeMap<usize, usize> = BTreeMap::new();
            let mut path: Vec<String> = Vec::new();
            let mut rows = Vec::new();
            for FlatBeat { beat, depth } in flatten(tree) {
                let ordinal = ordinals.entry(depth).or_default();
                *ordinal += 1;
                let title = display_title(hierarchy, beat, depth, *ordinal);

                path.truncate(depth);
                rows.push(OutlineRow {
                    depth,
                    level: hierarchy.level_name(depth).to_string(),
                    title: title.clone(),
                    card_count: cards.get(&beat.id).copied().unwrap_or(0),
                    context_path: path.clone(),
                });
                path.push(title);
            }
            Ok(rows)
        }

        /// Placeholder beats read as their level and running number.
        fn display_title(hierarchy: &HierarchyConfig, beat: &Beat, depth: usize, ordinal: usize) -> String {
            if beat.title == PLACEHOLDER_TITLE || beat.title.is_empty() {
                format!("{} {}", hierarchy.level_name(depth), ordinal)
            } else {
                beat.title.clone()
            }
        }

    }
}


pub use format::{format_outline, format_rows};
pub use parser::{StarOutlineParser, parse_outline_from_str};
pub use reducer::{Instruction, apply, apply_all, try_apply};
pub use storage::{JsonProjectRepository, OutlineParser, ProjectRepository};
