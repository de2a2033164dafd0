// Baker (L7b, 4.5): resolves a visual's vertex bindings/attributes and
// optional index/indirect buffers down to a set of `Dual`s, and
// forwards `data`/`repeat`/`quads`/`index` writes into them through
// the column API.
//
// Generalized from a single hardcoded textured-quad vertex layout to an
// arbitrary set of bindings/attributes a visual declares.

use crate::dual::Dual;
use crate::error::{DvzError, Result};
use crate::idmap::Id;
use crate::request::{BufferType, DatFlags, Request};

/// One vertex binding: a stride and the Dual backing it. `shared`
/// bindings point at an externally-managed dat the baker never
/// creates, resizes, or uploads (4.5).
pub struct Binding {
    pub stride: usize,
    pub shared: bool,
    pub dual: Dual,
}

/// One vertex attribute: which binding it belongs to, its byte offset
/// within an element, its size, and its Vulkan format (4.5).
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub binding_idx: usize,
    pub offset: usize,
    pub item_size: usize,
    pub format: i32,
}

pub struct Baker {
    bindings: Vec<Binding>,
    attrs: Vec<Attr>,
    index: Option<Dual>,
    indirect: Option<Dual>,
}

impl Baker {
    pub fn new() -> Self {
        Baker {
            bindings: Vec::new(),
            attrs: Vec::new(),
            index: None,
            indirect: None,
        }
    }

    pub fn add_binding(&mut self, stride: usize, shared: bool, dat_id: Id, count: usize) {
        self.bindings.push(Binding {
            stride,
            shared,
            dual: Dual::new(dat_id, stride, count),
        });
    }

    /// Declares one vertex attribute and checks 4.5's stride invariant
    /// for the binding it targets: `sum(item_size) <= stride`.
    pub fn add_attr(&mut self, attr: Attr) -> Result<()> {
        let binding = self
            .bindings
            .get(attr.binding_idx)
            .ok_or_else(|| DvzError::Other(format!("no binding {}", attr.binding_idx)))?;

        let used: usize = self
            .attrs
            .iter()
            .filter(|a| a.binding_idx == attr.binding_idx)
            .map(|a| a.item_size)
            .sum::<usize>()
            + attr.item_size;
        if used > binding.stride {
            return Err(DvzError::InvalidStride);
        }

        self.attrs.push(attr);
        Ok(())
    }

    pub fn set_index(&mut self, dat_id: Id, count: usize) {
        self.index = Some(Dual::new(dat_id, std::mem::size_of::<u32>(), count));
    }

    pub fn set_indirect(&mut self, dat_id: Id, count: usize) {
        self.indirect = Some(Dual::new(dat_id, std::mem::size_of::<u32>() * 5, count));
    }

    /// Allocates the non-shared duals and emits their `create`
    /// requests (4.5).
    pub fn create(
        &mut self,
        index_count: usize,
        vertex_count: usize,
        batch: &mut crate::request::Batch,
    ) {
        for binding in self.bindings.iter() {
            if binding.shared {
                continue;
            }
            batch.append(Request::dat_create(
                binding.dual.dat_id(),
                BufferType::Vertex,
                (vertex_count * binding.stride) as u64,
                DatFlags::empty(),
            ));
        }
        if let Some(index) = &self.index {
            batch.append(Request::dat_create(
                index.dat_id(),
                BufferType::Index,
                (index_count * std::mem::size_of::<u32>()) as u64,
                DatFlags::empty(),
            ));
        }
        if let Some(indirect) = &self.indirect {
            batch.append(Request::dat_create(
                indirect.dat_id(),
                BufferType::Storage,
                indirect.count() as u64 * std::mem::size_of::<u32>() as u64 * 5,
                DatFlags::empty(),
            ));
        }
    }

    /// Writes `count` whole elements of raw per-vertex bytes into
    /// `binding_idx` starting at `first`.
    pub fn data(&mut self, binding_idx: usize, first: usize, count: usize, ptr: &[u8]) -> Result<()> {
        let binding = self
            .bindings
            .get_mut(binding_idx)
            .ok_or_else(|| DvzError::Other(format!("no binding {}", binding_idx)))?;
        binding.dual.data(first, count, ptr);
        Ok(())
    }

    /// Writes one attribute's column, repeating each source row
    /// `repeats` times (e.g. 4 corners per quad sharing one source
    /// datum).
    pub fn repeat(
        &mut self,
        attr_idx: usize,
        first: usize,
        count: usize,
        repeats: usize,
        ptr: &[u8],
    ) -> Result<()> {
        let attr = *self
            .attrs
            .get(attr_idx)
            .ok_or_else(|| DvzError::Other(format!("no attr {}", attr_idx)))?;
        let binding = self
            .bindings
            .get_mut(attr.binding_idx)
            .ok_or_else(|| DvzError::Other(format!("no binding {}", attr.binding_idx)))?;
        binding
            .dual
            .column(attr.offset, attr.item_size, first, count, repeats, ptr);
        Ok(())
    }

    /// Convenience wrapper over `repeat` for the common 4-corners-per-
    /// quad layout.
    pub fn quads(&mut self, attr_idx: usize, first: usize, count: usize, ptr: &[u8]) -> Result<()> {
        self.repeat(attr_idx, first, count, 4, ptr)
    }

    pub fn index(&mut self, first: usize, count: usize, ptr: &[u8]) -> Result<()> {
        let index = self
            .index
            .as_mut()
            .ok_or_else(|| DvzError::Other("baker has no index buffer".to_string()))?;
        index.data(first, count, ptr);
        Ok(())
    }

    /// Calls `Dual::update()` on every non-shared dual (4.5).
    pub fn update(&mut self, batch: &mut crate::request::Batch) {
        for binding in self.bindings.iter_mut() {
            if !binding.shared {
                binding.dual.update(batch);
            }
        }
        if let Some(index) = self.index.as_mut() {
            index.update(batch);
        }
        if let Some(indirect) = self.indirect.as_mut() {
            indirect.update(batch);
        }
    }
}

impl Default for Baker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_within_stride_is_accepted() {
        let mut baker = Baker::new();
        baker.add_binding(12, false, 1, 4);
        baker
            .add_attr(Attr {
                binding_idx: 0,
                offset: 0,
                item_size: 8,
                format: 0,
            })
            .unwrap();
        baker
            .add_attr(Attr {
                binding_idx: 0,
                offset: 8,
                item_size: 4,
                format: 0,
            })
            .unwrap();
    }

    #[test]
    fn attr_exceeding_stride_is_rejected() {
        let mut baker = Baker::new();
        baker.add_binding(8, false, 1, 4);
        baker
            .add_attr(Attr {
                binding_idx: 0,
                offset: 0,
                item_size: 8,
                format: 0,
            })
            .unwrap();
        let err = baker.add_attr(Attr {
            binding_idx: 0,
            offset: 8,
            item_size: 4,
            format: 0,
        });
        assert!(matches!(err, Err(DvzError::InvalidStride)));
    }

    #[test]
    fn attr_on_unknown_binding_errors() {
        let mut baker = Baker::new();
        let err = baker.add_attr(Attr {
            binding_idx: 0,
            offset: 0,
            item_size: 4,
            format: 0,
        });
        assert!(err.is_err());
    }

    #[test]
    fn create_skips_shared_bindings() {
        let mut baker = Baker::new();
        baker.add_binding(12, false, 1, 4);
        baker.add_binding(12, true, 2, 4);
        baker.set_index(3, 6);

        let mut batch = crate::request::Batch::new();
        baker.create(6, 4, &mut batch);

        // Only the non-shared binding's dat and the index dat are
        // created, never the shared binding's.
        assert_eq!(batch.size(), 2);
        let ids: Vec<Id> = batch.requests().iter().map(|r| r.id).collect();
        assert!(ids.contains(&1));
        assert!(!ids.contains(&2));
        assert!(ids.contains(&3));
    }

    #[test]
    fn data_and_update_forward_into_the_right_binding() {
        let mut baker = Baker::new();
        baker.add_binding(4, false, 1, 4);
        baker.data(0, 0, 2, &[1u8; 8]).unwrap();

        let mut batch = crate::request::Batch::new();
        baker.update(&mut batch);
        assert_eq!(batch.size(), 1);
        assert_eq!(batch.requests()[0].id, 1);
    }

    #[test]
    fn update_skips_shared_bindings() {
        let mut baker = Baker::new();
        baker.add_binding(4, true, 2, 4);
        // A shared dual can still be written locally, but `update` must
        // never emit an upload for it -- its dat isn't the baker's to
        // manage.
        baker.data(0, 0, 1, &[9u8; 4]).unwrap();

        let mut batch = crate::request::Batch::new();
        baker.update(&mut batch);
        assert!(batch.is_empty());
    }
}
