//! Object heap, intern table, and tracing garbage collector.
//!
//! Non-moving, tri-color mark-and-sweep with deferred sweeping: closures↔upvalues↔stack,
//! classes↔methods, and modules↔globals all form cycles, which tracing handles directly
//! without a refcounting-plus-cycle-collector layered on top.

use std::hash::BuildHasher;

use ahash::AHashMap;

use crate::intern::StaticStr;
use crate::types::{BoundMethod, Class, Closure, Function, Generator, Instance, JList, JStarString, Module, NativeFn, StackTrace, Table, Tuple, Upvalue, Userdata};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// One heap object.
pub enum Obj {
    Str(JStarString),
    List(JList),
    Tuple(Tuple),
    Table(Table),
    Function(Function),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    Module(Module),
    BoundMethod(BoundMethod),
    Generator(Generator),
    Userdata(Userdata),
    StackTrace(StackTrace),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "String",
            Obj::List(_) => "List",
            Obj::Tuple(_) => "Tuple",
            Obj::Table(_) => "Table",
            Obj::Function(_) => "Function",
            Obj::Native(_) => "Native",
            Obj::Closure(_) => "Closure",
            Obj::Upvalue(_) => "Upvalue",
            Obj::Class(_) => "Class",
            Obj::Instance(_) => "Instance",
            Obj::Module(_) => "Module",
            Obj::BoundMethod(_) => "BoundMethod",
            Obj::Generator(_) => "Generator",
            Obj::Userdata(_) => "Userdata",
            Obj::StackTrace(_) => "StackTrace",
        }
    }
}

struct Slot {
    obj: Option<Obj>,
    marked: bool,
}

/// Allocation/GC accounting, reported by `stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_objects: usize,
    pub allocated_bytes: usize,
    pub next_gc_threshold: usize,
}

/// The object heap, string intern table, and mark-sweep GC for one [`crate::vm::Vm`]: kept as
/// VM-instance state rather than global so multiple `Vm`s can coexist.
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    by_content: AHashMap<Box<str>, HeapId>,
    static_strings: AHashMap<StaticStr, HeapId>,
    allocated_bytes: usize,
    threshold: usize,
    heap_grow_rate: f64,
    pub stress_gc: bool,
}

impl Heap {
    pub fn new(initial_threshold: usize, heap_grow_rate: f64) -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            by_content: AHashMap::new(),
            static_strings: AHashMap::new(),
            allocated_bytes: 0,
            threshold: initial_threshold,
            heap_grow_rate,
            stress_gc: false,
        };
        for variant in StaticStr::all() {
            let id = heap.intern(variant.as_str());
            heap.static_strings.insert(variant, id);
        }
        heap
    }

    pub fn static_id(&self, s: StaticStr) -> HeapId {
        self.static_strings[&s]
    }

    fn approx_size(obj: &Obj) -> usize {
        match obj {
            Obj::Str(s) => 32 + s.bytes.len(),
            Obj::List(l) => 24 + l.items.len() * 16,
            Obj::Tuple(t) => 24 + t.items.len() * 16,
            Obj::Table(t) => 24 + t.len() * 32,
            Obj::Userdata(u) => 24 + u.bytes.len(),
            _ => 48,
        }
    }

    /// Raw allocation. Does not itself trigger a collection: callers check
    /// `should_collect()` and, if set, mark their own roots (VM stack, open upvalues, the
    /// module table) before calling `sweep()`.
    fn insert(&mut self, obj: Obj) -> HeapId {
        self.allocated_bytes += Self::approx_size(&obj);
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot { obj: Some(obj), marked: false };
            return HeapId(idx);
        }
        let id = HeapId(self.slots.len() as u32);
        self.slots.push(Slot { obj: Some(obj), marked: false });
        id
    }

    pub fn alloc(&mut self, obj: Obj) -> HeapId {
        self.insert(obj)
    }

    /// Interns `s`, returning the canonical [`HeapId`] for its content. Two calls with equal bytes always return the same id.
    pub fn intern(&mut self, s: &str) -> HeapId {
        if let Some(&id) = self.by_content.get(s) {
            return id;
        }
        let hash = ahash::RandomState::new().hash_one(s);
        let id = self.insert(Obj::Str(JStarString::new(s, hash)));
        self.by_content.insert(s.into(), id);
        id
    }

    pub fn get(&self, id: HeapId) -> &Obj {
        self.slots[id.0 as usize].obj.as_ref().expect("dereferencing a freed HeapId")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut Obj {
        self.slots[id.0 as usize].obj.as_mut().expect("dereferencing a freed HeapId")
    }

    pub fn str_of(&self, id: HeapId) -> &str {
        match self.get(id) {
            Obj::Str(s) => s.as_str(),
            other => panic!("HeapId did not name a String (was {})", other.type_name()),
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.allocated_bytes >= self.threshold
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.slots.iter().filter(|s| s.obj.is_some()).count(),
            allocated_bytes: self.allocated_bytes,
            next_gc_threshold: self.threshold,
        }
    }

    // ---- mark-and-sweep ----

    /// Marks `id` and transitively everything it references, pushing newly-discovered
    /// objects onto a gray worklist rather than recursing (keeps stack depth bounded by
    /// worklist size, not heap-graph depth).
    pub fn mark(&mut self, id: HeapId) {
        let idx = id.0 as usize;
        if self.slots[idx].marked {
            return;
        }
        let mut gray = vec![id];
        self.slots[idx].marked = true;
        while let Some(cur) = gray.pop() {
            self.mark_children(cur, &mut gray);
        }
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(id) = v {
            self.mark(id);
        }
    }

    /// Roots the dunder/well-known method name strings: nothing in the ordinary object graph references
    /// `"__iter__"` unless some class happens to define a method by that name, so without
    /// this they would be swept the first time a cycle runs with none yet defined.
    pub fn mark_static_strings(&mut self) {
        let ids: Vec<HeapId> = self.static_strings.values().copied().collect();
        for id in ids {
            self.mark(id);
        }
    }

    fn mark_children(&mut self, id: HeapId, gray: &mut Vec<HeapId>) {
        let mut push = |id: HeapId, gray: &mut Vec<HeapId>, slots: &mut [Slot]| {
            let idx = id.0 as usize;
            if !slots[idx].marked {
                slots[idx].marked = true;
                gray.push(id);
            }
        };
        // Collect referenced ids first (immutable borrow of `self.get`), then mark them
        // (mutable borrow of `self.slots`), to avoid aliasing `self` across the match.
        let mut referenced_objs: Vec<HeapId> = Vec::new();
        let mut referenced_vals: Vec<Value> = Vec::new();
        match self.get(id) {
            Obj::Str(_) | Obj::Native(_) | Obj::Userdata(_) | Obj::StackTrace(_) => {}
            Obj::List(l) => referenced_vals.extend(l.items.iter().copied()),
            Obj::Tuple(t) => referenced_vals.extend(t.items.iter().copied()),
            Obj::Table(t) => {
                for (k, v) in t.iter() {
                    referenced_vals.push(k);
                    referenced_vals.push(v);
                }
            }
            Obj::Function(f) => {
                referenced_objs.push(f.name);
                referenced_objs.push(f.source_path);
                referenced_vals.extend(f.defaults.iter().copied());
            }
            Obj::Closure(c) => {
                referenced_objs.push(c.function);
                referenced_objs.push(c.module);
                referenced_objs.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let Upvalue::Closed(v) = u {
                    referenced_vals.push(*v);
                }
            }
            Obj::Class(c) => {
                referenced_objs.push(c.name);
                if let Some(s) = c.superclass {
                    referenced_objs.push(s);
                }
                referenced_objs.extend(c.methods.keys().copied());
                referenced_vals.extend(c.methods.values().copied());
            }
            Obj::Instance(i) => {
                referenced_objs.push(i.class);
                for (k, v) in i.fields.iter() {
                    referenced_vals.push(k);
                    referenced_vals.push(v);
                }
            }
            Obj::Module(m) => {
                referenced_objs.push(m.name);
                for (k, v) in m.globals.iter() {
                    referenced_vals.push(k);
                    referenced_vals.push(v);
                }
            }
            Obj::BoundMethod(b) => {
                referenced_vals.push(b.receiver);
                referenced_vals.push(b.method);
            }
            Obj::Generator(g) => {
                referenced_objs.push(g.closure);
                referenced_vals.extend(g.saved_stack.iter().copied());
            }
        }
        for v in referenced_vals {
            if let Value::Obj(oid) = v {
                push(oid, gray, &mut self.slots);
            }
        }
        for oid in referenced_objs {
            push(oid, gray, &mut self.slots);
        }
    }

    /// Frees every object not marked live, then clears all marks for the next cycle.
    /// Userdata finalizers run via `Drop` when their slot's `Option<Obj>` is taken.
    pub fn sweep(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.obj.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                if let Some(Obj::Str(s)) = &slot.obj {
                    self.by_content.remove(&*s.bytes);
                }
                slot.obj = None;
                self.free_list.push(idx as u32);
            }
        }
        self.allocated_bytes = self.slots.iter().filter_map(|s| s.obj.as_ref()).map(Self::approx_size).sum();
        self.threshold = ((self.allocated_bytes as f64) * self.heap_grow_rate).max(1.0) as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_equal_content_returns_same_id() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_content_gets_distinct_ids() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let a = heap.intern("foo");
        let b = heap.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn sweep_frees_unmarked_objects_and_reuses_their_slot() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let id = heap.alloc(Obj::List(JList::new()));
        heap.sweep();
        let new_id = heap.alloc(Obj::List(JList::new()));
        assert_eq!(id, new_id);
    }

    #[test]
    fn marked_objects_survive_a_sweep() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let id = heap.alloc(Obj::List(JList::new()));
        heap.mark(id);
        heap.sweep();
        assert!(matches!(heap.get(id), Obj::List(_)));
    }

    #[test]
    fn marking_a_list_transitively_marks_contained_objects() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let inner = heap.alloc(Obj::List(JList::new()));
        let outer = heap.alloc(Obj::List(JList::with_items(vec![Value::Obj(inner)])));
        heap.mark(outer);
        heap.sweep();
        assert!(matches!(heap.get(inner), Obj::List(_)));
    }
}
