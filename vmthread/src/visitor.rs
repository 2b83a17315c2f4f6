use crate::{Isolate, ObjectRef};

/// Something that holds raw references the collector must see and may
/// update in place.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut ObjectRef));
}

/// Roots and remembered-set entries for one collection.
#[derive(Debug, Default)]
pub struct RootSet {
    pub roots: Vec<ObjectRef>,
    pub remember: Vec<ObjectRef>,
}

impl RootSet {
    pub fn collect(provider: &mut dyn RootProvider) -> Self {
        let mut set = RootSet::default();
        set.add_roots(provider);
        set
    }

    pub fn add_roots(&mut self, provider: &mut dyn RootProvider) {
        provider.visit_roots(&mut |slot| {
            if !slot.is_null() {
                self.roots.push(*slot);
            }
        });
    }

    /// Drains the isolate's write-barrier records into the remembered set.
    pub fn take_remembered(&mut self, isolate: &Isolate) {
        self.remember.extend(isolate.store_buffer().take_records());
    }
}
