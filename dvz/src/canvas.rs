// L3 Canvas: a windowed swapchain or an offscreen render target (4.6).
//
// Grounded on an on-screen swapchain's
// create/recreate/select_images_and_views/present sequence and an
// offscreen "board" path: a fixed pair of LINEAR-tiled images with no
// real swapchain. Both shapes are folded into one object here since
// every operation a Canvas needs -- acquire/recreate/present/resolution
// -- is the same either way; only where the backing images come from
// differs.

#![allow(dead_code)]

use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};
use crate::request::CanvasFlags;
use dvz_utils::log;

use std::sync::Arc;

const BOARD_WIDTH: u32 = 640;
const BOARD_HEIGHT: u32 = 480;
const BOARD_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[cfg(feature = "sdl")]
enum Backend {
    Window {
        window: sdl2::video::Window,
        surface_loader: khr::Surface,
        surface: vk::SurfaceKHR,
        swapchain_loader: khr::Swapchain,
        swapchain: vk::SwapchainKHR,
        present_mode: vk::PresentModeKHR,
    },
    Offscreen {
        memories: Vec<vk::DeviceMemory>,
    },
}

#[cfg(not(feature = "sdl"))]
enum Backend {
    Offscreen { memories: Vec<vk::DeviceMemory> },
}

/// Either a windowed swapchain or an offscreen render target (3.4,
/// 4.6). Owns its images/views, presentation sync, and the queue it
/// presents/renders with; the renderpass, framebuffers, depth image
/// and recorder that also get rebuilt on resize live one level up in
/// `Renderer`/`Recorder`, which watch `Canvas::generation`.
pub struct Canvas {
    dev: Arc<Device>,
    backend: Backend,
    pub flags: CanvasFlags,
    pub resolution: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub current_image: u32,
    /// Signaled by `acquire_next_image`, consumed by the first command
    /// buffer submission of the frame.
    pub present_sema: vk::Semaphore,
    /// Signaled by the last command buffer submission of the frame,
    /// waited on by `present`.
    pub frame_sema: vk::Semaphore,
    /// Bumped every time `recreate` runs; the recorder uses this to
    /// know its framebuffers/depth image are stale (4.6: "recorder is
    /// reattached after each resize and marked fully dirty").
    pub generation: u64,
}

impl Canvas {
    /// Creates either a windowed canvas (`offscreen == false`) or a
    /// "board" (`offscreen == true`, 3.4). Windowed canvases require
    /// the `sdl` feature; requesting one without it is
    /// `DvzError::UnsupportedFeature`.
    pub fn new(
        dev: Arc<Device>,
        width: u32,
        height: u32,
        flags: CanvasFlags,
        offscreen: bool,
    ) -> Result<Self> {
        if offscreen {
            Self::new_offscreen(dev, width, height, flags)
        } else {
            Self::new_windowed(dev, width, height, flags)
        }
    }

    fn new_offscreen(dev: Arc<Device>, width: u32, height: u32, flags: CanvasFlags) -> Result<Self> {
        let width = if width == 0 { BOARD_WIDTH } else { width };
        let height = if height == 0 { BOARD_HEIGHT } else { height };
        let resolution = vk::Extent2D { width, height };

        let graphics_queue_family = Self::select_any_graphics_family(&dev)?;
        dev.register_graphics_queue_family(graphics_queue_family);
        let present_queue = unsafe { dev.dev.get_device_queue(graphics_queue_family, 0) };

        let (images, views, memories) = Self::create_offscreen_images(&dev, &resolution);

        let sema_info = vk::SemaphoreCreateInfo::default();
        let present_sema = unsafe { dev.dev.create_semaphore(&sema_info, None).unwrap() };
        let frame_sema = unsafe { dev.dev.create_semaphore(&sema_info, None).unwrap() };

        Ok(Canvas {
            dev,
            backend: Backend::Offscreen { memories },
            flags,
            resolution,
            format: BOARD_FORMAT,
            images,
            views,
            graphics_queue_family,
            present_queue,
            current_image: 0,
            present_sema,
            frame_sema,
            generation: 0,
        })
    }

    fn create_offscreen_images(
        dev: &Device,
        resolution: &vk::Extent2D,
    ) -> (Vec<vk::Image>, Vec<vk::ImageView>, Vec<vk::DeviceMemory>) {
        let mut images = Vec::new();
        let mut views = Vec::new();
        let mut memories = Vec::new();

        // Two images: the steady-state in-flight count the presenter
        // assumes everywhere else (8, "MAX_FRAMES_IN_FLIGHT = 2").
        for _ in 0..2 {
            let (image, view, mem) = dev.create_image(
                resolution,
                BOARD_FORMAT,
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::ImageTiling::LINEAR,
            );

            images.push(image);
            views.push(view);
            memories.push(mem);
        }

        (images, views, memories)
    }

    fn select_any_graphics_family(dev: &Device) -> Result<u32> {
        unsafe { dev.inst.inst.get_physical_device_queue_family_properties(dev.pdev) }
            .iter()
            .enumerate()
            .find(|(_, info)| info.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .ok_or(DvzError::UnsupportedFeature(
                "no graphics-capable queue family".to_string(),
            ))
    }

    #[cfg(feature = "sdl")]
    fn new_windowed(dev: Arc<Device>, width: u32, height: u32, flags: CanvasFlags) -> Result<Self> {
        let sdl_ctx = sdl2::init().map_err(DvzError::Other)?;
        let video = sdl_ctx.video().map_err(DvzError::Other)?;
        // The Sdl context itself is ref-counted by SDL; leak our handle
        // to this canvas and let the window keep the subsystem alive.
        std::mem::forget(sdl_ctx);

        let window = video
            .window("dvz", width.max(1), height.max(1))
            .vulkan()
            .resizable()
            .build()
            .map_err(|e| DvzError::Other(e.to_string()))?;

        let surface_loader = khr::Surface::new(&dev.inst.loader, &dev.inst.inst);
        let surface = {
            use vk::Handle;
            let raw = window
                .vulkan_create_surface(dev.inst.inst.handle().as_raw() as usize)
                .map_err(DvzError::Other)?;
            vk::SurfaceKHR::from_raw(raw)
        };

        let graphics_queue_family =
            Self::select_present_family(&dev, &surface_loader, surface)?;
        dev.register_graphics_queue_family(graphics_queue_family);
        let present_queue = unsafe { dev.dev.get_device_queue(graphics_queue_family, 0) };

        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, surface)
                .unwrap()
        };
        let present_mode = present_modes
            .iter()
            .cloned()
            .find(|&m| m == vk::PresentModeKHR::FIFO)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        let sema_info = vk::SemaphoreCreateInfo::default();
        let present_sema = unsafe { dev.dev.create_semaphore(&sema_info, None).unwrap() };
        let frame_sema = unsafe { dev.dev.create_semaphore(&sema_info, None).unwrap() };

        let mut canvas = Canvas {
            dev,
            backend: Backend::Window {
                window,
                surface_loader,
                surface,
                swapchain_loader,
                swapchain: vk::SwapchainKHR::null(),
                present_mode,
            },
            flags,
            resolution: vk::Extent2D { width, height },
            format: vk::Format::UNDEFINED,
            images: Vec::new(),
            views: Vec::new(),
            graphics_queue_family,
            present_queue,
            current_image: 0,
            present_sema,
            frame_sema,
            generation: 0,
        };

        canvas.create_swapchain()?;
        Ok(canvas)
    }

    #[cfg(not(feature = "sdl"))]
    fn new_windowed(_dev: Arc<Device>, _width: u32, _height: u32, _flags: CanvasFlags) -> Result<Self> {
        Err(DvzError::UnsupportedFeature(
            "windowed canvases require the 'sdl' feature".to_string(),
        ))
    }

    #[cfg(feature = "sdl")]
    fn select_present_family(
        dev: &Device,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<u32> {
        unsafe { dev.inst.inst.get_physical_device_queue_family_properties(dev.pdev) }
            .iter()
            .enumerate()
            .find(|(i, info)| {
                info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && unsafe {
                        surface_loader
                            .get_physical_device_surface_support(dev.pdev, *i as u32, surface)
                            .unwrap_or(false)
                    }
            })
            .map(|(i, _)| i as u32)
            .ok_or(DvzError::UnsupportedFeature(
                "no queue family supports both graphics and this surface".to_string(),
            ))
    }

    #[cfg(feature = "sdl")]
    fn create_swapchain(&mut self) -> Result<()> {
        let (surface_loader, surface, swapchain_loader, old_swapchain, present_mode) =
            match &self.backend {
                Backend::Window {
                    surface_loader,
                    surface,
                    swapchain_loader,
                    swapchain,
                    present_mode,
                    ..
                } => (surface_loader, *surface, swapchain_loader, *swapchain, *present_mode),
                Backend::Offscreen { .. } => unreachable!("resize on an offscreen board"),
            };

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(self.dev.pdev, surface)
                .unwrap()
        };
        let format = Self::select_surface_format(surface_loader, surface, self.dev.pdev)?;

        let mut desired_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && desired_count > caps.max_image_count {
            desired_count = caps.max_image_count;
        }

        let extent = match caps.current_extent.width {
            u32::MAX => self.resolution,
            _ => caps.current_extent,
        };

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(desired_count)
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain);

        let new_swapchain = unsafe {
            swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(DvzError::Other("vkCreateSwapchainKHR failed".to_string())))?
        };

        self.destroy_swapchain_resources();

        let images = unsafe {
            swapchain_loader
                .get_swapchain_images(new_swapchain)
                .or(Err(DvzError::Other("vkGetSwapchainImagesKHR failed".to_string())))?
        };
        let mut views = Vec::new();
        for image in images.iter() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);
            let view = unsafe {
                self.dev
                    .dev
                    .create_image_view(&create_info, None)
                    .or(Err(DvzError::Other("vkCreateImageView failed".to_string())))?
            };
            views.push(view);
        }

        if let Backend::Window { swapchain, .. } = &mut self.backend {
            *swapchain = new_swapchain;
        }
        self.images = images;
        self.views = views;
        self.format = format.format;
        self.resolution = extent;
        self.generation += 1;

        Ok(())
    }

    #[cfg(feature = "sdl")]
    fn select_surface_format(
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        pdev: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(pdev, surface)
                .or(Err(DvzError::Other("vkGetPhysicalDeviceSurfaceFormatsKHR failed".to_string())))?
        };

        formats
            .iter()
            .map(|fmt| match fmt.format {
                vk::Format::UNDEFINED => vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: fmt.color_space,
                },
                _ => *fmt,
            })
            .next()
            .ok_or(DvzError::Other("surface has no supported formats".to_string()))
    }

    fn destroy_swapchain_resources(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.dev.dev.destroy_image_view(view, None);
            }
        }
        #[cfg(feature = "sdl")]
        if let Backend::Window {
            swapchain_loader,
            swapchain,
            ..
        } = &mut self.backend
        {
            if *swapchain != vk::SwapchainKHR::null() {
                unsafe { swapchain_loader.destroy_swapchain(*swapchain, None) };
                *swapchain = vk::SwapchainKHR::null();
            }
        }
    }

    /// Rebuilds the Canvas for a new size. A request that doesn't
    /// change the extent is a no-op (see DESIGN.md).
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        if width == self.resolution.width && height == self.resolution.height {
            return Ok(());
        }

        unsafe { self.dev.dev.device_wait_idle().unwrap() };

        match &mut self.backend {
            #[cfg(feature = "sdl")]
            Backend::Window { .. } => {
                self.resolution = vk::Extent2D { width, height };
                self.create_swapchain()?;
            }
            Backend::Offscreen { memories } => {
                unsafe {
                    for image in self.images.drain(..) {
                        self.dev.dev.destroy_image(image, None);
                    }
                    for view in self.views.drain(..) {
                        self.dev.dev.destroy_image_view(view, None);
                    }
                    for mem in memories.drain(..) {
                        self.dev.free_memory(mem);
                    }
                }
                let resolution = vk::Extent2D { width, height };
                let (images, views, new_memories) =
                    Self::create_offscreen_images(&self.dev, &resolution);
                self.images = images;
                self.views = views;
                *memories = new_memories;
                self.resolution = resolution;
                self.generation += 1;
            }
        }

        Ok(())
    }

    /// Acquires the next image to render into. Translates
    /// `ERROR_OUT_OF_DATE_KHR`/`SUBOPTIMAL_KHR` to
    /// `DvzError::SwapchainOutOfDate` so the presenter can catch and
    /// resize around it (7).
    pub fn acquire_next_image(&mut self) -> Result<u32> {
        match &self.backend {
            #[cfg(feature = "sdl")]
            Backend::Window {
                swapchain_loader,
                swapchain,
                ..
            } => loop {
                match unsafe {
                    swapchain_loader.acquire_next_image(
                        *swapchain,
                        0,
                        self.present_sema,
                        vk::Fence::null(),
                    )
                } {
                    Ok((index, _)) => {
                        self.current_image = index;
                        return Ok(index);
                    }
                    Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => continue,
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
                    | Err(vk::Result::SUBOPTIMAL_KHR) => {
                        return Err(DvzError::SwapchainOutOfDate)
                    }
                    Err(e) => {
                        log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                        return Err(DvzError::Other("vkAcquireNextImageKHR failed".to_string()));
                    }
                }
            },
            Backend::Offscreen { .. } => {
                self.current_image = (self.current_image + 1) % self.images.len() as u32;
                Ok(self.current_image)
            }
        }
    }

    /// Presents the current image. A no-op for an offscreen board.
    pub fn present(&mut self) -> Result<()> {
        match &self.backend {
            #[cfg(feature = "sdl")]
            Backend::Window {
                swapchain_loader,
                swapchain,
                ..
            } => {
                let wait_semas = [self.frame_sema];
                let swapchains = [*swapchain];
                let indices = [self.current_image];
                let info = vk::PresentInfoKHR::builder()
                    .wait_semaphores(&wait_semas)
                    .swapchains(&swapchains)
                    .image_indices(&indices);

                match unsafe { swapchain_loader.queue_present(self.present_queue, &info) } {
                    Ok(_) => Ok(()),
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
                    | Err(vk::Result::SUBOPTIMAL_KHR) => Err(DvzError::SwapchainOutOfDate),
                    Err(_) => Err(DvzError::Other("vkQueuePresentKHR failed".to_string())),
                }
            }
            Backend::Offscreen { .. } => Ok(()),
        }
    }

    pub fn is_offscreen(&self) -> bool {
        matches!(self.backend, Backend::Offscreen { .. })
    }

    /// The mapped-at-creation `VkDeviceMemory` backing the currently
    /// acquired image, for an offscreen board only (6.3 PNG capture).
    /// Windowed canvases have no host-visible swapchain memory to read.
    pub fn current_offscreen_memory(&self) -> Option<vk::DeviceMemory> {
        match &self.backend {
            Backend::Offscreen { memories } => memories.get(self.current_image as usize).copied(),
            #[cfg(feature = "sdl")]
            Backend::Window { .. } => None,
        }
    }
}

impl Drop for Canvas {
    fn drop(&mut self) {
        unsafe {
            self.dev.dev.device_wait_idle().unwrap();
            self.dev.dev.destroy_semaphore(self.frame_sema, None);
            self.dev.dev.destroy_semaphore(self.present_sema, None);
        }

        match &mut self.backend {
            Backend::Offscreen { memories } => unsafe {
                for image in self.images.drain(..) {
                    self.dev.dev.destroy_image(image, None);
                }
                for view in self.views.drain(..) {
                    self.dev.dev.destroy_image_view(view, None);
                }
                for mem in memories.drain(..) {
                    self.dev.free_memory(mem);
                }
            },
            #[cfg(feature = "sdl")]
            Backend::Window { .. } => {
                self.destroy_swapchain_resources();
                if let Backend::Window {
                    surface_loader,
                    surface,
                    ..
                } = &self.backend
                {
                    unsafe { surface_loader.destroy_surface(*surface, None) };
                }
            }
        }
    }
}

/// Instance extensions the windowed canvas path needs enabled up
/// front, before any `Canvas` exists (instance.rs calls this while
/// building the `vkInstance`). Always includes `VK_KHR_surface` plus
/// whatever SDL reports for the host platform; empty without the
/// `sdl` feature, matching the offscreen-only build.
#[cfg(feature = "sdl")]
pub fn required_instance_extensions() -> Vec<*const i8> {
    let ctx = sdl2::init().expect("SDL init failed");
    let video = ctx.video().expect("SDL video subsystem init failed");
    let window = video
        .window("dvz-probe", 1, 1)
        .vulkan()
        .hidden()
        .build()
        .expect("could not create probe window for instance extension query");

    window
        .vulkan_instance_extensions()
        .expect("SDL could not report required Vulkan instance extensions")
        .iter()
        .map(|s| {
            let cstr = std::ffi::CString::new(*s).unwrap();
            let ptr = cstr.as_ptr();
            std::mem::forget(cstr);
            ptr
        })
        .collect()
}

#[cfg(not(feature = "sdl"))]
pub fn required_instance_extensions() -> Vec<*const i8> {
    Vec::new()
}
