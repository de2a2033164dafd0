// Dual (L7a, 4.4): a CPU-side shadow array paired with a `Dat`, and
// the sole path visuals use to get data to the GPU -- they write into
// the CPU array and call `update()`; nothing enqueues `upload`
// requests directly.
//
// Grounded on the row-range-restricted image upload in
// `Device::update_image_contents_from_damaged_data`, generalized from
// "one contiguous damaged row range" to "one contiguous dirty element
// interval" over an arbitrary stride.

use crate::idmap::Id;
use crate::request::{BufferType, DatFlags, ObjectType, Request};

/// `(CPU array, dat_id, dirty_first, dirty_last)` (4.4). `stride` is
/// the per-element byte size; the CPU array always holds a whole
/// number of elements.
pub struct Dual {
    dat_id: Id,
    stride: usize,
    cpu: Vec<u8>,
    /// `None` when clean; `Some((first, last))` is the half-open
    /// element interval `[first, last)` needing an upload.
    dirty: Option<(usize, usize)>,
}

impl Dual {
    pub fn new(dat_id: Id, stride: usize, count: usize) -> Self {
        Dual {
            dat_id,
            stride,
            cpu: vec![0u8; stride * count],
            dirty: None,
        }
    }

    pub fn dat_id(&self) -> Id {
        self.dat_id
    }

    pub fn count(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.cpu.len() / self.stride
        }
    }

    fn mark_dirty(&mut self, first: usize, last: usize) {
        self.dirty = Some(match self.dirty {
            Some((d_first, d_last)) => (d_first.min(first), d_last.max(last)),
            None => (first, last),
        });
    }

    /// Copies `count` elements from `ptr` into the CPU array starting
    /// at element `first`; enlarges the dirty interval to
    /// `[min(dirty_first, first), max(dirty_last, first+count))`.
    pub fn data(&mut self, first: usize, count: usize, ptr: &[u8]) {
        let byte_off = first * self.stride;
        let byte_len = count * self.stride;
        debug_assert_eq!(ptr.len(), byte_len);
        self.cpu[byte_off..byte_off + byte_len].copy_from_slice(ptr);
        self.mark_dirty(first, first + count);
    }

    /// Scatters one column of `col_size` bytes into a strided layout:
    /// element `first + k*repeats` (for `k` in `0..count`, when
    /// `repeats > 1` the same source row is written `repeats` times
    /// consecutively) gets `col_size` bytes written at `offset` within
    /// its element. Used for vertex interleaving.
    pub fn column(
        &mut self,
        offset: usize,
        col_size: usize,
        first: usize,
        count: usize,
        repeats: usize,
        ptr: &[u8],
    ) {
        let repeats = repeats.max(1);
        debug_assert_eq!(ptr.len(), col_size * count);

        for k in 0..count {
            let src = &ptr[k * col_size..(k + 1) * col_size];
            for r in 0..repeats {
                let elem = first + k * repeats + r;
                let byte_off = elem * self.stride + offset;
                self.cpu[byte_off..byte_off + col_size].copy_from_slice(src);
            }
        }

        self.mark_dirty(first, first + count * repeats);
    }

    /// Grows the CPU array to `count` elements and emits a `resize`
    /// request for the backing dat (4.4). The grown tail is
    /// zero-initialized and left out of the dirty interval; callers
    /// that need it uploaded call `data`/`column` on it afterwards.
    pub fn resize(&mut self, count: usize, batch: &mut crate::request::Batch) {
        self.cpu.resize(count * self.stride, 0);
        batch.append(Request::resize(
            ObjectType::Dat,
            self.dat_id,
            (count * self.stride) as u32,
            0,
            0,
        ));
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    /// Emits one `upload` request covering exactly the minimal dirty
    /// byte interval, then clears it. No-op on a clean dual (4.4).
    pub fn update(&mut self, batch: &mut crate::request::Batch) {
        let Some((first, last)) = self.dirty else {
            return;
        };

        let byte_off = first * self.stride;
        let byte_len = (last - first) * self.stride;
        let payload = self.cpu[byte_off..byte_off + byte_len].to_vec();

        batch.append(Request::upload(self.dat_id, byte_off as u64, payload));
        self.dirty = None;
    }

    /// Emits the `create` request for this dual's backing dat. Only
    /// used by duals the baker creates itself (non-`shared` bindings);
    /// shared duals point at an externally-managed dat and never call
    /// this.
    pub fn create_request(
        dat_id: Id,
        buffer_type: BufferType,
        size: u64,
        flags: DatFlags,
    ) -> Request {
        Request::dat_create(dat_id, buffer_type, size, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Action;

    #[test]
    fn fresh_dual_is_clean() {
        let dual = Dual::new(1, 4, 8);
        assert!(!dual.is_dirty());
        assert_eq!(dual.count(), 8);
    }

    #[test]
    fn data_marks_minimal_dirty_interval_and_update_uploads_it() {
        let mut dual = Dual::new(1, 4, 8);
        dual.data(2, 3, &[1u8; 12]);
        assert!(dual.is_dirty());

        let mut batch = crate::request::Batch::new();
        dual.update(&mut batch);
        assert!(!dual.is_dirty(), "update must clear the dirty interval");

        let req = &batch.requests()[0];
        assert_eq!(req.action, Action::Upload);
        match &req.content {
            crate::request::RequestContent::Upload { offset, data } => {
                assert_eq!(*offset, 2 * 4);
                assert_eq!(data.len(), 3 * 4);
            }
            _ => panic!("expected an Upload request"),
        }
    }

    #[test]
    fn two_writes_enlarge_dirty_interval_to_their_union() {
        let mut dual = Dual::new(1, 4, 8);
        dual.data(5, 2, &[1u8; 8]);
        dual.data(0, 1, &[2u8; 4]);

        let mut batch = crate::request::Batch::new();
        dual.update(&mut batch);
        match &batch.requests()[0].content {
            crate::request::RequestContent::Upload { offset, data } => {
                assert_eq!(*offset, 0);
                assert_eq!(data.len(), 7 * 4, "must cover [0, 7) to span both writes");
            }
            _ => panic!("expected an Upload request"),
        }
    }

    #[test]
    fn update_on_clean_dual_emits_nothing() {
        let mut dual = Dual::new(1, 4, 4);
        let mut batch = crate::request::Batch::new();
        dual.update(&mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn column_scatters_with_repeats_and_marks_dirty() {
        let mut dual = Dual::new(1, 8, 4);
        dual.column(0, 4, 0, 2, 2, &[1u8, 2, 3, 4, 5, 6, 7, 8]);
        assert!(dual.is_dirty());

        let mut batch = crate::request::Batch::new();
        dual.update(&mut batch);
        match &batch.requests()[0].content {
            crate::request::RequestContent::Upload { offset, data } => {
                assert_eq!(*offset, 0);
                assert_eq!(data.len(), 4 * 8, "repeats=2 over count=2 touches 4 elements");
            }
            _ => panic!("expected an Upload request"),
        }
    }

    #[test]
    fn resize_grows_cpu_array_and_emits_resize_request() {
        let mut dual = Dual::new(1, 4, 2);
        let mut batch = crate::request::Batch::new();
        dual.resize(10, &mut batch);
        assert_eq!(dual.count(), 10);
        assert!(!dual.is_dirty(), "grown tail is not itself dirty");

        let req = &batch.requests()[0];
        assert_eq!(req.action, Action::Resize);
        assert_eq!(req.object_type, ObjectType::Dat);
    }
}
