//! The fixed set of dunder/well-known method names the VM looks up by identity during
//! operator dispatch and iteration (`__iter__`/
//! `__next__`). The [`crate::heap::Heap`] pre-interns every variant at construction time so
//! looking one up at dispatch time never allocates.

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter, strum::IntoStaticStr)]
#[allow(non_camel_case_types)]
pub enum StaticStr {
    __add__,
    __sub__,
    __mul__,
    __div__,
    __mod__,
    __pow__,
    __eq__,
    __lt__,
    __le__,
    __get__,
    __set__,
    __call__,
    __iter__,
    __next__,
    __string__,
    __hash__,
    construct,
    close,
    msg,
}

impl StaticStr {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn all() -> impl Iterator<Item = StaticStr> {
        <StaticStr as strum::IntoEnumIterator>::iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_round_trips_through_as_str() {
        for v in StaticStr::all() {
            assert!(v.as_str().starts_with("__") || !v.as_str().is_empty());
        }
    }
}
