// Datoviz core (L0-L9): a request-driven GPU scientific-visualization
// engine built on Vulkan via `ash`.
//
// The renderer this crate is descended from is grounded module-by-
// module in DESIGN.md. It keeps that renderer's central idea -- the
// renderer is the sole owner of every Vulkan-backed object, everything
// else holds an opaque `Id` -- generalized from "one swapchain, one
// compositor" to "every object type a request batch can create".

extern crate dvz_utils;

pub mod baker;
pub mod canvas;
pub mod capture;
pub mod client;
pub mod deletion_queue;
pub mod deq;
pub mod descpool;
pub mod device;
pub mod dual;
pub mod error;
pub mod idmap;
pub mod instance;
pub mod platform;
pub mod presenter;
pub mod recorder;
pub mod renderer;
pub mod request;
pub mod shader;
pub mod timer;

pub use deletion_queue::DeletionQueue;
pub use error::{DvzError, ErrorCallback, Result};
pub use idmap::Id;
pub use request::{Action, Batch, CanvasFlags, DatFlags, ObjectType, Request, Requester, TexFlags};

use std::sync::Arc;

/// Construction-time configuration (design notes, "Global state must
/// thread through Host/App explicitly" -- this is that explicit
/// carrier, read once at `Instance`/`Device`/`Presenter` construction).
#[derive(Clone)]
pub struct CreateInfo {
    pub app_name: String,
    pub window_width: u32,
    pub window_height: u32,
    pub default_canvas_flags: CanvasFlags,
    /// `DVZ_NUM_THREADS` (6.2): default worker-thread pool size. Not
    /// yet consumed by a thread pool of its own -- client ASYNC
    /// callback dispatch currently runs inline off the deq drain --
    /// but it is threaded through from construction so that pool can
    /// be added without another config plumbing pass.
    pub num_threads: usize,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder::default()
    }
}

impl Default for CreateInfo {
    fn default() -> Self {
        let num_threads = std::env::var("DVZ_NUM_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));

        CreateInfo {
            app_name: "Datoviz".to_string(),
            window_width: 800,
            window_height: 600,
            default_canvas_flags: CanvasFlags::empty(),
            num_threads,
        }
    }
}

#[derive(Default)]
pub struct CreateInfoBuilder {
    info: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.info.app_name = name.into();
        self
    }

    pub fn window_size(mut self, width: u32, height: u32) -> Self {
        self.info.window_width = width;
        self.info.window_height = height;
        self
    }

    pub fn canvas_flags(mut self, flags: CanvasFlags) -> Self {
        self.info.default_canvas_flags = flags;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.info.num_threads = n;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.info
    }
}

/// Top-level handle: the Vulkan instance, the presenter (renderer +
/// client), and the installable error callback, all in one place so
/// none of it needs to live behind a module-level global (design
/// notes, "Global state").
pub struct App {
    presenter: presenter::Presenter,
}

impl App {
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let instance = Arc::new(instance::Instance::new(info));
        let presenter = presenter::Presenter::new(instance, info)?;
        Ok(App { presenter })
    }

    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.presenter.set_error_callback(callback);
    }

    pub fn presenter(&mut self) -> &mut presenter::Presenter {
        &mut self.presenter
    }

    /// Drives the presenter's frame loop (4.8) until `n_frames` have
    /// been presented (0 = forever, or until `destroy()`/`stop()`).
    pub fn run(&mut self, n_frames: u64) -> Result<()> {
        self.presenter.run(n_frames)
    }

    /// `app.destroy()` (5): implies `stop()`, then -- once this value
    /// drops -- waits the render queue idle and tears every layer down
    /// in reverse of construction (`Presenter` -> `Renderer` ->
    /// `Device` -> `Instance`, each in its own `Drop` impl).
    pub fn destroy(self) {
        self.presenter.stop();
    }
}
