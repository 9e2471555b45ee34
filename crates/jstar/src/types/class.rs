//! *Class*: name string, optional superclass pointer, table of methods.
//! *Instance*: class pointer + per-instance field table.

use ahash::AHashMap;

use crate::heap::HeapId;
use crate::types::table::Table;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Class {
    pub name: HeapId,
    pub superclass: Option<HeapId>,
    /// Method name (interned string id) → callable (`Value::Obj` closure/native).
    pub methods: AHashMap<HeapId, Value>,
}

impl Class {
    pub fn new(name: HeapId, superclass: Option<HeapId>) -> Self {
        Self { name, superclass, methods: AHashMap::new() }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub class: HeapId,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: HeapId) -> Self {
        Self { class, fields: Table::new() }
    }
}
