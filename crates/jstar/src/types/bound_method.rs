//! *Bound method*: receiver + method callable. Produced by `BIND_METHOD` when a
//! method is read off an instance as a value rather than immediately invoked by `INVOKE`.

use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}
