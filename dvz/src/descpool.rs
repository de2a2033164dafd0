// An allocator for bindless image/sampler descriptor sets.
//
// Tex objects (4.2) each need one COMBINED_IMAGE_SAMPLER descriptor so the
// bindless fragment shader can index into them. Pools fill up to POOL_SIZE
// sets and a new one is created on demand; individual sets are freed back
// into their own pool rather than the whole pool being torn down.
//
// Austin Shafer - 2020

#![allow(dead_code)]
extern crate ash;

use ash::{vk, Device};

/// The default size of each pool in DescPool
static POOL_SIZE: u32 = 4;

/// A single allocated descriptor set plus the pool it came from, so it
/// can be freed back individually (4.2: a Tex's descriptor is torn down
/// when the Tex is destroyed, independent of any other Tex).
#[derive(Clone, Copy)]
pub struct Descriptor {
    pub d_set: vk::DescriptorSet,
    pool_handle: usize,
}

/// A pool of descriptor pools, all sharing one bindless image/sampler
/// layout. Owned by `DeviceInternal`.
pub struct DescPool {
    /// Layout shared by every descriptor this pool hands out. Referenced
    /// as set 1 by the bindless fragment shader.
    pub layout: vk::DescriptorSetLayout,
    pools: Vec<vk::DescriptorPool>,
    /// number of allocations in each pool, from 0 to POOL_SIZE
    capacities: Vec<usize>,
}

impl DescPool {
    /// Descriptor layouts specify the number and characteristics of
    /// descriptor sets which will be made available to the pipeline
    /// through the pipeline layout.
    fn create_layout(dev: &Device) -> vk::DescriptorSetLayout {
        // This descriptor needs to be second in the pipeline list
        // so the shader can reference it as set 1
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .descriptor_count(1)
            .build()];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        unsafe { dev.create_descriptor_set_layout(&info, None).unwrap() }
    }

    /// Returns the index of the new pool
    fn add_pool(&mut self, dev: &Device) -> usize {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(POOL_SIZE)
            .build()];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // we want to be able to free descriptor sets individually
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE);

        self.pools
            .push(unsafe { dev.create_descriptor_pool(&info, None).unwrap() });
        self.capacities.push(0);

        self.pools.len() - 1
    }

    pub fn new(dev: &Device) -> DescPool {
        let mut ret = DescPool {
            layout: DescPool::create_layout(dev),
            pools: Vec::new(),
            capacities: Vec::new(),
        };

        // Add one default pool to begin with
        ret.add_pool(dev);

        ret
    }

    fn get_ideal_pool(&mut self, dev: &Device) -> usize {
        for (i, cap) in self.capacities.iter().enumerate() {
            if *cap < POOL_SIZE as usize {
                return i;
            }
        }

        self.add_pool(dev)
    }

    /// Allocate a single bindless image/sampler descriptor set.
    ///
    /// A descriptor set specifies a group of attachments that can be
    /// referenced by the graphics pipeline. The caller is responsible
    /// for writing the actual image/sampler binding in afterwards.
    pub fn alloc_descriptor(&mut self, dev: &Device) -> Descriptor {
        let pool_handle = self.get_ideal_pool(dev);

        let layouts = [self.layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[pool_handle])
            .set_layouts(&layouts)
            .build();

        self.capacities[pool_handle] += 1;

        let set = unsafe { dev.allocate_descriptor_sets(&info).unwrap()[0] };

        Descriptor {
            d_set: set,
            pool_handle,
        }
    }

    /// Frees a single descriptor set back to its pool.
    pub fn free_descriptor(&mut self, dev: &Device, descriptor: &Descriptor) {
        assert!(descriptor.pool_handle < self.pools.len());

        unsafe {
            dev.free_descriptor_sets(self.pools[descriptor.pool_handle], &[descriptor.d_set])
                .unwrap();
        }
        self.capacities[descriptor.pool_handle] -= 1;
    }

    /// Explicit destructor
    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            for p in self.pools.iter() {
                dev.destroy_descriptor_pool(*p, None);
            }
            dev.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
