// Dat resource (3.4, 4.2): the GPU buffer backing a single Dat, plus
// the CPU write path that honors the `DatFlags` edge policies.
//
// Grounded on `Device::create_buffer`/`create_buffer_with_size`/
// `update_memory` (device.rs) and the transfer-buffer-reuse pattern in
// `Device::upload_memimage_to_transfer`, generalized from "one shared
// image transfer buffer" to "one staging buffer per mappable-less Dat".

use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};
use crate::request::{BufferType, DatFlags};

fn usage_for(buffer_type: BufferType) -> vk::BufferUsageFlags {
    let transfer = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
    transfer
        | match buffer_type {
            BufferType::Staging => vk::BufferUsageFlags::empty(),
            BufferType::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferType::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferType::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferType::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
}

/// Vulkan-backed state for a single Dat: the device buffer/memory pair,
/// and (when the dat isn't `MAPPABLE`) a staging buffer used to ferry
/// CPU writes across the transfer queue.
pub struct BufferVk {
    pub b_buffer: vk::Buffer,
    pub b_memory: vk::DeviceMemory,
    pub b_size: u64,
    pub b_buffer_type: BufferType,
    pub b_flags: DatFlags,
    /// Present only when `PERSISTENT_STAGING` is set; reused across
    /// every `upload` instead of being created/destroyed per-transfer.
    persistent_staging: Option<(vk::Buffer, vk::DeviceMemory)>,
}

impl BufferVk {
    pub fn new(dev: &Device, buffer_type: BufferType, size: u64, flags: DatFlags) -> Result<Self> {
        let usage = usage_for(buffer_type);
        let alloc_size = size.max(1);
        let mem_flags = if flags.contains(DatFlags::MAPPABLE) {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let (buffer, memory) =
            dev.create_buffer_with_size(usage, vk::SharingMode::EXCLUSIVE, mem_flags, alloc_size);
        unsafe {
            dev.dev
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(|_| DvzError::ResourceExhausted("dat buffer bind".to_string()))?;
        }

        let persistent_staging = if flags.contains(DatFlags::PERSISTENT_STAGING)
            && !flags.contains(DatFlags::MAPPABLE)
        {
            Some(dev.create_buffer_with_size(
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::SharingMode::EXCLUSIVE,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                alloc_size,
            ))
        } else {
            None
        };

        Ok(BufferVk {
            b_buffer: buffer,
            b_memory: memory,
            b_size: size,
            b_buffer_type: buffer_type,
            b_flags: flags,
            persistent_staging,
        })
    }

    /// Writes `data` at `offset` into this Dat (4.2's `upload`).
    ///
    /// `MAPPABLE` dats are written straight to their own host-visible
    /// memory. Everything else goes through a staging buffer and a
    /// transfer-queue copy; the staging buffer is kept around when
    /// `PERSISTENT_STAGING` is set, otherwise it's created and
    /// destroyed around this one transfer.
    pub fn upload(&mut self, dev: &Device, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() as u64 > self.b_size {
            return Err(DvzError::ResourceExhausted(
                "upload exceeds dat size".to_string(),
            ));
        }

        if self.b_flags.contains(DatFlags::MAPPABLE) {
            dev.update_memory(self.b_memory, offset as isize, data);
            return Ok(());
        }

        let (staging_buf, staging_mem, owns_staging) = match self.persistent_staging {
            Some((b, m)) => (b, m, false),
            None => {
                let (b, m) = dev.create_buffer_with_size(
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    vk::SharingMode::EXCLUSIVE,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    data.len() as u64,
                );
                (b, m, true)
            }
        };

        dev.update_memory(staging_mem, 0, data);
        dev.copy_buffer_region(staging_buf, 0, self.b_buffer, offset, data.len() as u64);

        if owns_staging {
            dev.wait_for_copy();
            unsafe {
                dev.dev.destroy_buffer(staging_buf, None);
                dev.free_memory(staging_mem);
            }
        }

        Ok(())
    }

    /// Reads `size` bytes back from `offset` (4.2's `download`). Only
    /// meaningful for `MAPPABLE` dats; non-mappable dats require a
    /// staging round trip the caller doesn't need here since downloads
    /// are a debugging/readback path, not a hot one.
    pub fn download(&self, dev: &Device, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset + size > self.b_size {
            return Err(DvzError::ResourceExhausted(
                "download exceeds dat size".to_string(),
            ));
        }
        if !self.b_flags.contains(DatFlags::MAPPABLE) {
            return Err(DvzError::UnsupportedFeature(
                "download requires a MAPPABLE dat".to_string(),
            ));
        }

        unsafe {
            let ptr = dev
                .dev
                .map_memory(
                    self.b_memory,
                    offset,
                    size,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(|_| DvzError::ResourceExhausted("dat map for download".to_string()))?;
            let mut out = vec![0u8; size as usize];
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), size as usize);
            dev.dev.unmap_memory(self.b_memory);
            Ok(out)
        }
    }

    /// Replaces the backing buffer with one of `new_size`, honoring
    /// `KEEP_ON_RESIZE` (4.2's `resize` edge policy): contents are
    /// copied over when set, left undefined otherwise.
    pub fn resize(&mut self, dev: &Device, new_size: u64) -> Result<()> {
        if new_size == self.b_size {
            return Ok(());
        }

        let usage = usage_for(self.b_buffer_type);
        let mem_flags = if self.b_flags.contains(DatFlags::MAPPABLE) {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let (new_buffer, new_memory) = dev.create_buffer_with_size(
            usage,
            vk::SharingMode::EXCLUSIVE,
            mem_flags,
            new_size.max(1),
        );
        unsafe {
            dev.dev
                .bind_buffer_memory(new_buffer, new_memory, 0)
                .map_err(|_| DvzError::ResourceExhausted("dat resize bind".to_string()))?;
        }

        if self.b_flags.contains(DatFlags::KEEP_ON_RESIZE) {
            let keep = new_size.min(self.b_size);
            if keep > 0 {
                dev.copy_buffer_region(self.b_buffer, 0, new_buffer, 0, keep);
                dev.wait_for_copy();
            }
        }

        unsafe {
            dev.dev.destroy_buffer(self.b_buffer, None);
            dev.free_memory(self.b_memory);
        }
        self.b_buffer = new_buffer;
        self.b_memory = new_memory;
        self.b_size = new_size;
        Ok(())
    }

    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            dev.dev.destroy_buffer(self.b_buffer, None);
            dev.free_memory(self.b_memory);
            if let Some((b, m)) = self.persistent_staging.take() {
                dev.dev.destroy_buffer(b, None);
                dev.free_memory(m);
            }
        }
    }
}
