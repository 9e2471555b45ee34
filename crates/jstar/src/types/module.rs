//! *Module*: name, globals table, import-path list (only on `__core__`), native registry
//! pointer if any.

use crate::heap::HeapId;
use crate::types::table::Table;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Module {
    pub name: HeapId,
    pub globals: Table,
}

impl Module {
    pub fn new(name: HeapId) -> Self {
        Self { name, globals: Table::new() }
    }

    pub fn get_global(&self, key: Value) -> Option<Value> {
        self.globals.get(key)
    }

    pub fn set_global(&mut self, key: Value, value: Value) {
        self.globals.set(key, value);
    }
}
