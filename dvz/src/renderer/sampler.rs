// Sampler resource (3.4, 4.2): a standalone VkSampler parameterized by
// the filter/address-mode pair a `sampler_create` request carries.
//
// Grounded on `Device::create_sampler` (device.rs), generalized from a
// single hardcoded bindless sampler to one VkSampler per Sampler object,
// with `filter`/`address_mode` taken verbatim as raw VkFilter/
// VkSamplerAddressMode values (6.1).

use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};

pub struct SamplerVk {
    pub s_sampler: vk::Sampler,
    pub s_filter: i32,
    pub s_address_mode: i32,
}

impl SamplerVk {
    pub fn new(dev: &Device, filter: i32, address_mode: i32) -> Result<Self> {
        let vk_filter = vk::Filter::from_raw(filter);
        let vk_address_mode = vk::SamplerAddressMode::from_raw(address_mode);

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk_filter)
            .min_filter(vk_filter)
            .address_mode_u(vk_address_mode)
            .address_mode_v(vk_address_mode)
            .address_mode_w(vk_address_mode)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        let sampler = unsafe {
            dev.dev
                .create_sampler(&info, None)
                .map_err(|_| DvzError::ResourceExhausted("sampler creation".to_string()))?
        };

        Ok(SamplerVk {
            s_sampler: sampler,
            s_filter: filter,
            s_address_mode: address_mode,
        })
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_sampler(self.s_sampler, None);
        }
    }
}
