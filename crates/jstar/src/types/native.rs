//! *Native*: function pointer with fixed arity and optional defaults.
//!
//! Native callees run synchronously inside `CALL`: on success they leave exactly one value
//! in place of the callee slot; on failure they signal a guest exception.

use crate::embed::NativeResult;
use crate::heap::HeapId;
use crate::vm::Vm;

pub type NativeFnPtr = fn(&mut Vm) -> NativeResult;

#[derive(Clone, Copy)]
pub struct NativeFn {
    pub name: HeapId,
    pub required_arity: u8,
    pub has_vararg: bool,
    pub func: NativeFnPtr,
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).field("arity", &self.required_arity).finish()
    }
}
