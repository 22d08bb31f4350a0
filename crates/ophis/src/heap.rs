//! Heap arena, object layouts, and the tracing collector's root contract.
//!
//! Every heap object is one arena slot whose [`HeapData`] variant is its
//! layout: [`LayoutId`] is the dense runtime-type identifier derived from
//! the variant, and typed access checks it, failing with an
//! internal-consistency cast error when the dynamic type does not match.
//! Slots are recycled through a free list; objects never move, so a
//! `HeapId` stays valid for the object's lifetime.
//!
//! # Collection and roots
//!
//! The collector is a mark-and-sweep over the arena. It only ever runs
//! between instructions (the dispatch loop checks [`Heap::should_gc`] at the
//! top of each iteration) or when the embedder asks for it, never in the
//! middle of an opcode handler - values held in Rust locals inside one
//! handler are therefore safe. Anything that must survive *across*
//! instructions or embedding calls must be reachable from a root: the VM's
//! value stack (frame locals included, since locals are stack slots), the
//! globals namespace, the claimed-exception stack, and the handle stack.
//! [`Heap::collect`] takes a closure that visits every root slot by
//! `&mut Value`, which is the contract a relocating collector would use to
//! rewrite roots in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    exceptions::{RunError, RunResult, SimpleException},
    resource::{ResourceError, ResourceTracker},
    types::{Cell, Closure, Dict, Generator, List, LongInt, SeqIter, Str, Tuple},
    value::Value,
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Payload of one heap object; the variant is the object's layout.
#[derive(Debug, Clone, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(LayoutId), derive(Hash, IntoStaticStr))]
pub(crate) enum HeapData {
    LongInt(LongInt),
    Str(Str),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    Cell(Cell),
    Closure(Closure),
    SeqIter(SeqIter),
    Generator(Generator),
    Exception(SimpleException),
}

impl LayoutId {
    /// The Python-style type name for this layout.
    #[must_use]
    pub(crate) fn py_name(self) -> &'static str {
        match self {
            Self::LongInt => "int",
            Self::Str => "str",
            Self::Tuple => "tuple",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Cell => "cell",
            Self::Closure => "function",
            Self::SeqIter => "iterator",
            Self::Generator => "generator",
            Self::Exception => "exception",
        }
    }
}

impl HeapData {
    /// Returns this object's dense runtime-type identifier.
    #[inline]
    pub fn layout(&self) -> LayoutId {
        LayoutId::from(self)
    }

    /// Estimated memory size in bytes, for resource tracking.
    fn estimate_size(&self) -> usize {
        match self {
            Self::LongInt(n) => n.estimate_size(),
            Self::Str(s) => s.estimate_size(),
            Self::Tuple(t) => t.estimate_size(),
            Self::List(l) => l.estimate_size(),
            Self::Dict(d) => d.estimate_size(),
            Self::Cell(_) => std::mem::size_of::<Cell>(),
            Self::Closure(c) => c.estimate_size(),
            Self::SeqIter(_) => std::mem::size_of::<SeqIter>(),
            Self::Generator(g) => g.estimate_size(),
            Self::Exception(_) => std::mem::size_of::<SimpleException>() + 64,
        }
    }

    /// Enumerates the heap ids this object keeps alive.
    fn trace(&self, mark: &mut impl FnMut(HeapId)) {
        let mut mark_value = |v: &Value| {
            if let Value::Ref(id) = v {
                mark(*id);
            }
        };
        match self {
            Self::LongInt(_) | Self::Str(_) => {}
            Self::Tuple(t) => t.items().iter().for_each(&mut mark_value),
            Self::List(l) => l.items().iter().for_each(&mut mark_value),
            Self::Dict(d) => {
                for (key, value) in d.iter() {
                    mark_value(&key);
                    mark_value(&value);
                }
            }
            Self::Cell(c) => mark_value(&c.value),
            Self::Closure(c) => c.cells.iter().copied().for_each(mark),
            Self::SeqIter(it) => mark(it.seq),
            Self::Generator(g) => {
                g.locals.iter().for_each(&mut mark_value);
                g.saved_stack.iter().for_each(&mut mark_value);
                g.saved_contexts.iter().for_each(&mut mark_value);
                g.cells.iter().copied().for_each(mark);
            }
            Self::Exception(exc) => {
                if let Some(payload) = exc.payload() {
                    mark_value(&payload);
                }
            }
        }
    }
}

/// A single arena slot: `None` while on the free list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HeapEntry {
    data: Option<HeapData>,
    #[serde(skip)]
    marked: bool,
}

/// Snapshot of heap state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by layout name.
    pub objects_by_layout: BTreeMap<&'static str, usize>,
}

/// The heap arena.
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<HeapEntry>,
    free: Vec<u32>,
    tracker: T,
    /// Allocations since the last collection, for `should_gc`.
    allocations_since_gc: usize,
    /// Allocation-pressure threshold that makes `should_gc` fire.
    gc_threshold: usize,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            tracker,
            allocations_since_gc: 0,
            gc_threshold: 10_000,
        }
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Sets the allocation-pressure threshold for automatic collection.
    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.gc_threshold = threshold;
    }

    /// Allocates a new heap object, checking resource budgets first.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.track_allocation(data.estimate_size())?;
        Ok(self.place(data))
    }

    /// Allocates without consulting the budget.
    ///
    /// Reserved for materializing the exception object a handler receives:
    /// a budget violation must stay reportable and claimable even though
    /// the budget is already exhausted.
    pub fn allocate_untracked(&mut self, data: HeapData) -> HeapId {
        self.place(data)
    }

    fn place(&mut self, data: HeapData) -> HeapId {
        self.allocations_since_gc += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.data.is_none(), "free-list slot is occupied");
            entry.data = Some(data);
            entry.marked = false;
            HeapId(index)
        } else {
            let index = u32::try_from(self.entries.len()).expect("heap arena exceeds u32 slots");
            self.entries.push(HeapEntry {
                data: Some(data),
                marked: false,
            });
            HeapId(index)
        }
    }

    /// Returns the object at `id`.
    ///
    /// A dangling id is a corrupted-root invariant violation, not a
    /// recoverable condition.
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries[id.index()]
            .data
            .as_ref()
            .expect("heap access to freed slot: a live reference escaped the root set")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries[id.index()]
            .data
            .as_mut()
            .expect("heap access to freed slot: a live reference escaped the root set")
    }

    fn cast_error(&self, id: HeapId, expected: &'static str) -> RunError {
        RunError::internal(format!(
            "cast error: expected {expected}, found {}",
            self.get(id).layout().py_name()
        ))
    }

    /// Typed view of a generator object.
    pub fn get_generator(&self, id: HeapId) -> RunResult<&Generator> {
        match self.get(id) {
            HeapData::Generator(g) => Ok(g),
            _ => Err(self.cast_error(id, "generator")),
        }
    }

    pub fn get_generator_mut(&mut self, id: HeapId) -> RunResult<&mut Generator> {
        if !matches!(self.get(id), HeapData::Generator(_)) {
            return Err(self.cast_error(id, "generator"));
        }
        let HeapData::Generator(g) = self.get_mut(id) else {
            unreachable!()
        };
        Ok(g)
    }

    /// Typed view of a closure cell.
    pub fn get_cell(&self, id: HeapId) -> RunResult<&Cell> {
        match self.get(id) {
            HeapData::Cell(c) => Ok(c),
            _ => Err(self.cast_error(id, "cell")),
        }
    }

    pub fn get_cell_mut(&mut self, id: HeapId) -> RunResult<&mut Cell> {
        if !matches!(self.get(id), HeapData::Cell(_)) {
            return Err(self.cast_error(id, "cell"));
        }
        let HeapData::Cell(c) = self.get_mut(id) else {
            unreachable!()
        };
        Ok(c)
    }

    /// True when allocation pressure warrants a collection.
    #[inline]
    pub fn should_gc(&self) -> bool {
        self.allocations_since_gc >= self.gc_threshold
    }

    /// Runs a mark-and-sweep collection.
    ///
    /// `visit_roots` must call the supplied visitor on every live root slot,
    /// passing `&mut Value` so a relocating implementation could rewrite the
    /// reference in place. Extra non-value roots (frame cells, generator
    /// bindings) are marked through the same visitor by materializing them
    /// as `Value::Ref`. Returns the number of freed objects.
    pub fn collect(&mut self, visit_roots: impl FnOnce(&mut dyn FnMut(&mut Value))) -> usize {
        // Mark phase: gather root ids, then trace transitively.
        let mut worklist: Vec<HeapId> = Vec::new();
        visit_roots(&mut |slot: &mut Value| {
            if let Value::Ref(id) = slot {
                worklist.push(*id);
            }
        });
        while let Some(id) = worklist.pop() {
            let entry = &mut self.entries[id.index()];
            if entry.marked {
                continue;
            }
            entry.marked = true;
            if let Some(data) = &entry.data {
                data.trace(&mut |child| worklist.push(child));
            }
        }

        // Sweep phase: free unmarked slots, clear marks on survivors.
        let mut freed = 0;
        let Self { entries, free, tracker, .. } = self;
        for (index, entry) in entries.iter_mut().enumerate() {
            if entry.marked {
                entry.marked = false;
            } else if let Some(data) = entry.data.take() {
                tracker.track_free(data.estimate_size());
                free.push(u32::try_from(index).expect("heap arena exceeds u32 slots"));
                freed += 1;
            }
        }
        self.allocations_since_gc = 0;
        freed
    }

    /// Captures heap statistics.
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_layout: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live_objects = 0;
        for entry in &self.entries {
            if let Some(data) = &entry.data {
                live_objects += 1;
                *objects_by_layout.entry(data.layout().into()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects,
            free_slots: self.free.len(),
            total_slots: self.entries.len(),
            objects_by_layout,
        }
    }

    /// Exports all slots for snapshotting.
    pub fn export_entries(&self) -> &[HeapEntry] {
        &self.entries
    }

    /// Rebuilds a heap from snapshotted slots.
    pub fn from_entries(entries: Vec<HeapEntry>, tracker: T) -> Self {
        let free = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.data.is_none())
            .map(|(i, _)| u32::try_from(i).expect("heap arena exceeds u32 slots"))
            .collect();
        Self {
            entries,
            free,
            tracker,
            allocations_since_gc: 0,
            gc_threshold: 10_000,
        }
    }
}
