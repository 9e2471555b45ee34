//! *Userdata*: host-owned buffer of N bytes + optional finalizer function pointer.
//! The finalizer runs during sweep, on the VM thread only.

pub type Finalizer = fn(&mut [u8]);

pub struct Userdata {
    pub bytes: Box<[u8]>,
    pub finalizer: Option<Finalizer>,
}

impl std::fmt::Debug for Userdata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Userdata").field("len", &self.bytes.len()).field("has_finalizer", &self.finalizer.is_some()).finish()
    }
}

impl Drop for Userdata {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer {
            finalizer(&mut self.bytes);
        }
    }
}
