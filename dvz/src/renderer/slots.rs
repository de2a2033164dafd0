// Slots/Descriptors resources (3.4): a descriptor-set-layout object
// plus up to `image_count` parallel descriptor sets bound to it.
//
// Grounded on the per-Tex single-binding pool in descpool.rs,
// generalized here to an ordered list of bindings a pipeline declares
// up front rather than one fixed "combined image sampler" binding.

use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};

/// One entry in a Slots' ordered binding list (3.4: "ordered list of
/// descriptor types and push-constant ranges").
#[derive(Debug, Clone, Copy)]
pub struct SlotBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
}

/// What a single slot in a `Descriptors` set is currently bound to.
#[derive(Debug, Clone, Copy)]
pub enum SlotBindingValue {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    ImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
}

/// A DescriptorSetLayout plus the push-constant ranges that accompany
/// it in a pipeline layout.
pub struct SlotsVk {
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<SlotBinding>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl SlotsVk {
    pub fn new(
        dev: &Device,
        bindings: Vec<SlotBinding>,
        push_constant_ranges: Vec<vk::PushConstantRange>,
    ) -> Result<Self> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(b.stage_flags)
                    .build()
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        let layout = unsafe {
            dev.dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| DvzError::ResourceExhausted("slots layout creation".to_string()))?
        };

        Ok(SlotsVk {
            layout,
            bindings,
            push_constant_ranges,
        })
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Up to `image_count` parallel descriptor sets bound to one `Slots`
/// layout (3.4), one set per swapchain image in flight.
pub struct DescriptorsVk {
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    /// Per-set, per-binding current value; re-applied to the set
    /// whenever `bind` overwrites it so a resize/recreate can replay
    /// the latest bindings without the caller re-issuing every `bind`.
    current: Vec<Vec<Option<SlotBindingValue>>>,
}

impl DescriptorsVk {
    pub fn new(dev: &Device, slots: &SlotsVk, image_count: u32) -> Result<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = slots
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorPoolSize::builder()
                    .ty(b.descriptor_type)
                    .descriptor_count(image_count)
                    .build()
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(image_count);
        let pool = unsafe {
            dev.dev
                .create_descriptor_pool(&pool_info, None)
                .map_err(|_| DvzError::ResourceExhausted("descriptors pool creation".to_string()))?
        };

        let layouts = vec![slots.layout; image_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            dev.dev.allocate_descriptor_sets(&alloc_info).map_err(|_| {
                DvzError::ResourceExhausted("descriptors set allocation".to_string())
            })?
        };

        let current = vec![vec![None; slots.bindings.len()]; image_count as usize];

        Ok(DescriptorsVk {
            pool,
            sets,
            current,
        })
    }

    /// Writes `value` into `binding` of every parallel set (4.1's
    /// `bind` request targets a Descriptors object as a whole, not a
    /// single image index).
    pub fn bind(
        &mut self,
        dev: &Device,
        slots: &SlotsVk,
        slot_idx: u32,
        value: SlotBindingValue,
    ) -> Result<()> {
        let binding = slots
            .bindings
            .iter()
            .find(|b| b.binding == slot_idx)
            .ok_or_else(|| DvzError::Other(format!("no slot binding {}", slot_idx)))?;

        for (set_idx, set) in self.sets.iter().enumerate() {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(slot_idx)
                .dst_array_element(0)
                .descriptor_type(binding.descriptor_type);

            let buffer_info;
            let image_info;
            match value {
                SlotBindingValue::Buffer {
                    buffer,
                    offset,
                    range,
                } => {
                    buffer_info = [vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    }];
                    write = write.buffer_info(&buffer_info);
                    unsafe { dev.dev.update_descriptor_sets(&[write.build()], &[]) };
                }
                SlotBindingValue::ImageSampler { view, sampler } => {
                    image_info = [vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }];
                    write = write.image_info(&image_info);
                    unsafe { dev.dev.update_descriptor_sets(&[write.build()], &[]) };
                }
            }

            if let Some(binding_idx) = slots.bindings.iter().position(|b| b.binding == slot_idx) {
                self.current[set_idx][binding_idx] = Some(value);
            }
        }

        Ok(())
    }

    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            dev.dev.destroy_descriptor_pool(self.pool, None);
        }
    }
}
