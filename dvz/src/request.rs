// The request/batch protocol (L4) -- the single narrow waist through
// which every GPU state mutation flows. Grounded on the tagged-union
// `Task` dispatched over a channel in the windowing compositor this
// crate's renderer plumbing is descended from: here the channel
// hand-off becomes a plain `Vec<Request>` a `Batch` owns, and the enum
// grows from one compositor-specific operation into the full
// `(action, object_type)` matrix.

use crate::idmap::Id;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Action {
    Create,
    Resize,
    Set,
    Update,
    Upload,
    Download,
    Upfill,
    Delete,
    Record,
    Bind,
    Get,
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ObjectType {
    Board,
    Canvas,
    Dat,
    Tex,
    Sampler,
    Graphics,
    Compute,
    Shader,
    Slots,
    Descriptors,
    Recorder,
}

/// Bit-compatible with `VkBufferUsageFlags`-ish intent, but these are
/// the renderer's own small closed set (spec 6.1): staging=1, vertex=2,
/// index=3, storage=4, uniform=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferType {
    Staging = 1,
    Vertex = 2,
    Index = 3,
    Storage = 4,
    Uniform = 5,
}

bitflags::bitflags! {
    /// 6.1: DatFlags -- per-dat creation/behavior bits.
    pub struct DatFlags: u32 {
        /// Contents survive a `resize` instead of becoming undefined.
        const KEEP_ON_RESIZE     = 1 << 0;
        /// Dat is mappable; `upload` writes straight to the mapped
        /// pointer instead of going through a staging buffer.
        const MAPPABLE           = 1 << 1;
        /// A staging buffer is allocated once and reused for every
        /// upload instead of being created/destroyed per-transfer.
        const PERSISTENT_STAGING = 1 << 2;
        /// See DESIGN.md -- resolves the open question on
        /// `DVZ_DAT_FLAGS_DUP`: this dat keeps one CPU-visible copy
        /// shared across all swapchain images rather than one copy
        /// per in-flight image.
        const DUP                = 1 << 3;
    }
}

bitflags::bitflags! {
    /// 6.1: TexFlags.
    pub struct TexFlags: u32 {
        const PERSISTENT_STAGING = 1 << 0;
        const MIPMAPS            = 1 << 1;
    }
}

bitflags::bitflags! {
    /// 6.1: CanvasFlags.
    pub struct CanvasFlags: u32 {
        const VSYNC              = 1 << 0;
        const FPS                = 1 << 1;
        const IMGUI              = 1 << 2;
        const PICK               = 1 << 3;
        const WHITE_BACKGROUND   = 1 << 4;
        const OFFSCREEN_CAPTURE  = 1 << 5;
    }
}

/// Action-specific payload. One variant per `(action, object_type)`
/// family that actually carries data; `Request::content` is the
/// closed tagged union the router switches on alongside `action` and
/// `object_type`.
#[derive(Debug, Clone)]
pub enum RequestContent {
    None,
    CanvasCreate {
        width: u32,
        height: u32,
        flags: CanvasFlags,
    },
    BoardCreate {
        width: u32,
        height: u32,
        flags: CanvasFlags,
    },
    Resize {
        width: u32,
        height: u32,
        depth: u32,
    },
    DatCreate {
        buffer_type: BufferType,
        size: u64,
        flags: DatFlags,
    },
    TexCreate {
        dims: u8,
        format: i32, // bit-compatible VkFormat value
        width: u32,
        height: u32,
        depth: u32,
        flags: TexFlags,
    },
    SamplerCreate {
        filter: i32,       // VkFilter
        address_mode: i32, // VkSamplerAddressMode
    },
    Upload {
        offset: u64,
        /// Owned heap payload; ownership transfers to the `Batch`
        /// that appends this request (spec 3.2) and is released when
        /// the batch is destroyed.
        data: std::sync::Arc<Vec<u8>>,
    },
    Download {
        offset: u64,
        size: u64,
    },
    ShaderSpirv {
        stage: i32, // VkShaderStageFlags bit
        code: std::sync::Arc<Vec<u32>>,
    },
    ShaderGlsl {
        stage: i32,
        source: std::sync::Arc<String>,
    },
    GraphicsCreate,
    ComputeCreate,
    /// A standalone descriptor-set-layout object (3.4): an ordered list
    /// of `(binding, VkDescriptorType, VkShaderStageFlags)`.
    SlotsCreate {
        bindings: Vec<(u32, i32, u32)>,
    },
    /// Attaches a previously-created Shader object to a Graphics/Compute
    /// pipeline under construction (3.6: "shader modules added").
    AttachShader {
        shader_id: Id,
    },
    /// Declares the Slots (descriptor-set-layout) a Graphics/Compute
    /// pipeline binds against (3.6: "slots declared").
    SetSlots {
        slots_id: Id,
    },
    /// One vertex binding (4.5's binding/stride pair).
    VertexBinding {
        binding: u32,
        stride: u32,
        input_rate: i32, // VkVertexInputRate
    },
    /// One vertex attribute (4.5's (binding_idx, offset, item_size, format)).
    VertexAttr {
        binding: u32,
        location: u32,
        offset: u32,
        format: i32, // VkFormat
    },
    /// Fixed-function state (3.4); one request sets every field at
    /// once rather than one request per field, since Vulkan pipelines
    /// are immutable once built and there's no partial-state concept
    /// to preserve between calls.
    GraphicsState {
        topology: i32,     // VkPrimitiveTopology
        polygon_mode: i32, // VkPolygonMode
        cull_mode: i32,    // VkCullModeFlags
        front_face: i32,   // VkFrontFace
        blend_enable: bool,
        depth_test: bool,
        depth_write: bool,
    },
    Bind {
        slot_idx: u32,
        dat_or_tex: Id,
    },
    Record(Vec<crate::recorder::RecorderCommand>),
    Delete,
    Flush,
}

/// An immutable, value-typed record describing one atomic GPU-state
/// mutation (3.2).
#[derive(Debug, Clone)]
pub struct Request {
    pub version: u32,
    pub action: Action,
    pub object_type: ObjectType,
    /// Target object; 0 ("auto") when `action == Create` and the
    /// caller wants the renderer to mint a fresh id.
    pub id: Id,
    pub content: RequestContent,
    pub flags: u32,
}

impl Request {
    fn new(action: Action, object_type: ObjectType, id: Id, content: RequestContent) -> Self {
        Request {
            version: PROTOCOL_VERSION,
            action,
            object_type,
            id,
            content,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn canvas_create(id: Id, width: u32, height: u32, flags: CanvasFlags) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Canvas,
            id,
            RequestContent::CanvasCreate {
                width,
                height,
                flags,
            },
        )
    }

    pub fn board_create(id: Id, width: u32, height: u32, flags: CanvasFlags) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Board,
            id,
            RequestContent::BoardCreate {
                width,
                height,
                flags,
            },
        )
    }

    pub fn dat_create(id: Id, buffer_type: BufferType, size: u64, flags: DatFlags) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Dat,
            id,
            RequestContent::DatCreate {
                buffer_type,
                size,
                flags,
            },
        )
    }

    pub fn tex_create(
        id: Id,
        dims: u8,
        format: i32,
        width: u32,
        height: u32,
        depth: u32,
        flags: TexFlags,
    ) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Tex,
            id,
            RequestContent::TexCreate {
                dims,
                format,
                width,
                height,
                depth,
                flags,
            },
        )
    }

    pub fn sampler_create(id: Id, filter: i32, address_mode: i32) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Sampler,
            id,
            RequestContent::SamplerCreate {
                filter,
                address_mode,
            },
        )
    }

    pub fn resize(object_type: ObjectType, id: Id, width: u32, height: u32, depth: u32) -> Self {
        Self::new(
            Action::Resize,
            object_type,
            id,
            RequestContent::Resize {
                width,
                height,
                depth,
            },
        )
    }

    pub fn upload(id: Id, offset: u64, data: Vec<u8>) -> Self {
        Self::new(
            Action::Upload,
            ObjectType::Dat,
            id,
            RequestContent::Upload {
                offset,
                data: std::sync::Arc::new(data),
            },
        )
    }

    pub fn download(id: Id, offset: u64, size: u64) -> Self {
        Self::new(
            Action::Download,
            ObjectType::Dat,
            id,
            RequestContent::Download { offset, size },
        )
    }

    pub fn shader_spirv(id: Id, stage: i32, code: Vec<u32>) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Shader,
            id,
            RequestContent::ShaderSpirv {
                stage,
                code: std::sync::Arc::new(code),
            },
        )
    }

    pub fn shader_glsl(id: Id, stage: i32, source: String) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Shader,
            id,
            RequestContent::ShaderGlsl {
                stage,
                source: std::sync::Arc::new(source),
            },
        )
    }

    pub fn graphics_create(id: Id) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Graphics,
            id,
            RequestContent::GraphicsCreate,
        )
    }

    pub fn compute_create(id: Id) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Compute,
            id,
            RequestContent::ComputeCreate,
        )
    }

    pub fn slots_create(id: Id, bindings: Vec<(u32, i32, u32)>) -> Self {
        Self::new(
            Action::Create,
            ObjectType::Slots,
            id,
            RequestContent::SlotsCreate { bindings },
        )
    }

    pub fn attach_shader(object_type: ObjectType, id: Id, shader_id: Id) -> Self {
        Self::new(
            Action::Set,
            object_type,
            id,
            RequestContent::AttachShader { shader_id },
        )
    }

    pub fn set_slots(object_type: ObjectType, id: Id, slots_id: Id) -> Self {
        Self::new(
            Action::Set,
            object_type,
            id,
            RequestContent::SetSlots { slots_id },
        )
    }

    pub fn vertex_binding(id: Id, binding: u32, stride: u32, input_rate: i32) -> Self {
        Self::new(
            Action::Set,
            ObjectType::Graphics,
            id,
            RequestContent::VertexBinding {
                binding,
                stride,
                input_rate,
            },
        )
    }

    pub fn vertex_attr(id: Id, binding: u32, location: u32, offset: u32, format: i32) -> Self {
        Self::new(
            Action::Set,
            ObjectType::Graphics,
            id,
            RequestContent::VertexAttr {
                binding,
                location,
                offset,
                format,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn graphics_state(
        id: Id,
        topology: i32,
        polygon_mode: i32,
        cull_mode: i32,
        front_face: i32,
        blend_enable: bool,
        depth_test: bool,
        depth_write: bool,
    ) -> Self {
        Self::new(
            Action::Set,
            ObjectType::Graphics,
            id,
            RequestContent::GraphicsState {
                topology,
                polygon_mode,
                cull_mode,
                front_face,
                blend_enable,
                depth_test,
                depth_write,
            },
        )
    }

    pub fn bind(object_type: ObjectType, id: Id, slot_idx: u32, dat_or_tex: Id) -> Self {
        Self::new(
            Action::Bind,
            object_type,
            id,
            RequestContent::Bind { slot_idx, dat_or_tex },
        )
    }

    pub fn record(canvas_id: Id, commands: Vec<crate::recorder::RecorderCommand>) -> Self {
        Self::new(
            Action::Record,
            ObjectType::Recorder,
            canvas_id,
            RequestContent::Record(commands),
        )
    }

    pub fn delete(object_type: ObjectType, id: Id) -> Self {
        Self::new(Action::Delete, object_type, id, RequestContent::Delete)
    }

    pub fn flush() -> Self {
        Self::new(Action::Flush, ObjectType::Dat, 0, RequestContent::Flush)
    }
}

/// An ordered, growable buffer of requests plus an optional parallel
/// array of string descriptions (3.3). Single-producer: never read and
/// written concurrently.
pub struct Batch {
    requests: Vec<Request>,
    descriptions: Vec<Option<String>>,
    /// Flag word shared with the hosting app (offscreen/vsync/imgui/
    /// white-background, propagated into every `Create` request that
    /// doesn't set its own).
    pub flags: CanvasFlags,
}

impl Batch {
    pub fn new() -> Self {
        Batch {
            requests: Vec::new(),
            descriptions: Vec::new(),
            flags: CanvasFlags::empty(),
        }
    }

    pub fn size(&self) -> usize {
        self.requests.len()
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn append(&mut self, req: Request) {
        crate::log::req!("batch: {:?} {:?} id={}", req.action, req.object_type, req.id);
        self.requests.push(req);
        self.descriptions.push(None);
    }

    pub fn append_with_description(&mut self, req: Request, description: impl Into<String>) {
        crate::log::req!("batch: {:?} {:?} id={}", req.action, req.object_type, req.id);
        self.requests.push(req);
        self.descriptions.push(Some(description.into()));
    }

    pub fn descriptions(&self) -> &[Option<String>] {
        &self.descriptions
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.descriptions.clear();
    }

    /// Deep-clones the batch: the copy owns its own heap payloads.
    /// Used by the presenter so the app's primary batch can keep being
    /// edited while the copy is in flight (4.1).
    pub fn copy(&self) -> Batch {
        Batch {
            requests: self.requests.clone(),
            descriptions: self.descriptions.clone(),
            flags: self.flags,
        }
    }

    pub fn destroy(&mut self) {
        self.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends/flushes/copies a batch on behalf of an app. A thin wrapper
/// so client code never has to reach past it into `Batch` internals.
pub struct Requester {
    batch: Batch,
}

impl Requester {
    pub fn new() -> Self {
        Requester { batch: Batch::new() }
    }

    pub fn enqueue(&mut self, req: Request) {
        self.batch.append(req);
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }

    /// Takes a deep copy for submission and clears the original, per
    /// the presenter's per-frame protocol step 3. Short-circuits on an
    /// empty batch: never submits, never copies.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.batch.is_empty() {
            return None;
        }
        let copy = self.batch.copy();
        self.batch.clear();
        Some(copy)
    }
}

impl Default for Requester {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_sets_fields_in_order() {
        let req = Request::resize(ObjectType::Board, 9, 640, 480, 1);
        assert_eq!(req.action, Action::Resize);
        assert_eq!(req.object_type, ObjectType::Board);
        assert_eq!(req.id, 9);
    }

    #[test]
    fn batch_append_and_flush_roundtrips() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.append(Request::dat_create(1, BufferType::Vertex, 256, DatFlags::empty()));
        batch.append_with_description(
            Request::dat_create(2, BufferType::Index, 128, DatFlags::empty()),
            "indices",
        );
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.descriptions()[0], None);
        assert_eq!(batch.descriptions()[1].as_deref(), Some("indices"));

        let copy = batch.copy();
        assert_eq!(copy.size(), 2);
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(copy.size(), 2, "copy must not be affected by clearing the original");
    }

    #[test]
    fn requester_flush_is_none_when_empty() {
        let mut requester = Requester::new();
        assert!(requester.flush().is_none());

        requester.enqueue(Request::flush());
        let flushed = requester.flush().expect("non-empty batch must flush Some");
        assert_eq!(flushed.size(), 1);
        assert!(requester.batch().is_empty(), "flush must clear the live batch");
        assert!(requester.flush().is_none(), "flushing twice in a row yields None");
    }

    #[test]
    fn canvas_flags_bitflags_compose() {
        let flags = CanvasFlags::VSYNC | CanvasFlags::IMGUI;
        assert!(flags.contains(CanvasFlags::VSYNC));
        assert!(flags.contains(CanvasFlags::IMGUI));
        assert!(!flags.contains(CanvasFlags::PICK));
    }
}
