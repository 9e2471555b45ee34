//! *Table*: mapping from value to value using open addressing; insertion order is not
//! observable. Backed by `indexmap`, whose underlying `hashbrown` table is itself
//! open-addressed.

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use crate::value::Value;

/// Wraps [`Value`] so it can key a hash map using the same bitwise/identity equality the
/// language itself uses for non-overloaded comparisons.
#[derive(Debug, Clone, Copy)]
struct ValueKey(Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            Value::Number(n) => {
                0u8.hash(state);
                n.to_bits().hash(state);
            }
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Null => 2u8.hash(state),
            Value::Handle(h) => {
                3u8.hash(state);
                (h.0 as usize).hash(state);
            }
            Value::Obj(id) => {
                4u8.hash(state);
                id.index().hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    map: IndexMap<ValueKey, Value, ahash::RandomState>,
}

impl Table {
    pub fn new() -> Self {
        Self { map: IndexMap::default() }
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.map.get(&ValueKey(key)).copied()
    }

    pub fn set(&mut self, key: Value, value: Value) {
        self.map.insert(ValueKey(key), value);
    }

    pub fn remove(&mut self, key: Value) -> Option<Value> {
        self.map.shift_remove(&ValueKey(key))
    }

    pub fn contains(&self, key: Value) -> bool {
        self.map.contains_key(&ValueKey(key))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.map.iter().map(|(k, v)| (k.0, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut t = Table::new();
        t.set(Value::Number(1.0), Value::Bool(true));
        assert_eq!(t.get(Value::Number(1.0)), Some(Value::Bool(true)));
    }

    #[test]
    fn missing_key_is_none() {
        let t = Table::new();
        assert_eq!(t.get(Value::Number(1.0)), None);
    }
}
