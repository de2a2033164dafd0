// Shaders (4.10): two intake paths into a `VkShaderModule` -- raw
// SPIR-V words, or GLSL source compiled through a bundled compiler.
// Shader objects are kept in the Id map as reference-holders until the
// owning pipeline is destroyed (they don't do anything on their own
// once the module is attached to a pipeline).

use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};

pub struct ShaderVk {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

impl ShaderVk {
    /// Path (a): raw SPIR-V words, already compiled.
    pub fn from_spirv(dev: &Device, stage: i32, code: &[u32]) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe {
            dev.dev
                .create_shader_module(&info, None)
                .map_err(|_| DvzError::ShaderCompileError("invalid SPIR-V module".to_string()))?
        };

        Ok(ShaderVk {
            module,
            stage: vk::ShaderStageFlags::from_raw(stage as u32),
        })
    }

    /// Path (b): GLSL source compiled to SPIR-V via `shaderc`, then
    /// loaded the same way as path (a).
    #[cfg(feature = "glsl")]
    pub fn from_glsl(dev: &Device, stage: i32, source: &str) -> Result<Self> {
        let shader_kind = glsl_stage_to_shaderc(stage)?;

        let compiler = shaderc::Compiler::new()
            .ok_or_else(|| DvzError::ShaderCompileError("could not init shaderc".to_string()))?;
        let artifact = compiler
            .compile_into_spirv(source, shader_kind, "shader.glsl", "main", None)
            .map_err(|e| DvzError::ShaderCompileError(e.to_string()))?;

        Self::from_spirv(dev, stage, artifact.as_binary())
    }

    #[cfg(not(feature = "glsl"))]
    pub fn from_glsl(_dev: &Device, _stage: i32, _source: &str) -> Result<Self> {
        Err(DvzError::UnsupportedFeature(
            "GLSL shader intake requires the 'glsl' feature".to_string(),
        ))
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(feature = "glsl")]
fn glsl_stage_to_shaderc(stage: i32) -> Result<shaderc::ShaderKind> {
    let flags = vk::ShaderStageFlags::from_raw(stage as u32);
    Ok(match flags {
        f if f == vk::ShaderStageFlags::VERTEX => shaderc::ShaderKind::Vertex,
        f if f == vk::ShaderStageFlags::FRAGMENT => shaderc::ShaderKind::Fragment,
        f if f == vk::ShaderStageFlags::COMPUTE => shaderc::ShaderKind::Compute,
        f if f == vk::ShaderStageFlags::GEOMETRY => shaderc::ShaderKind::Geometry,
        _ => {
            return Err(DvzError::UnsupportedFeature(
                "unsupported shader stage for GLSL intake".to_string(),
            ))
        }
    })
}
