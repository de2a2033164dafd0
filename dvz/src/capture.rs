// PNG screenshot capture (6.2, 6.3): `DVZ_CAPTURE_PNG` forces offscreen
// rendering and writes the final board image out as a PNG.
//
// Grounded on `renderer/buffer.rs`'s `BufferVk::download` -- the same
// map/copy/unmap pattern, applied to a board's linear-tiled image
// memory instead of a buffer.

use ash::vk;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::canvas::Canvas;
use crate::device::Device;
use crate::error::{DvzError, Result};

/// `Some(path)` if `DVZ_CAPTURE_PNG` names a capture destination.
pub fn capture_path_from_env() -> Option<PathBuf> {
    std::env::var_os("DVZ_CAPTURE_PNG").map(PathBuf::from)
}

/// Reads back the currently acquired image of an offscreen board and
/// writes it to `path` as a tightly-packed RGB8 PNG (6.3). Anything
/// other than an offscreen board is `UnsupportedFeature`.
pub fn capture_png(dev: &Device, canvas: &Canvas, path: impl AsRef<Path>) -> Result<()> {
    let memory = canvas.current_offscreen_memory().ok_or_else(|| {
        DvzError::UnsupportedFeature("PNG capture requires an offscreen board".to_string())
    })?;
    let resolution = canvas.resolution;
    let pixel_count = (resolution.width * resolution.height) as usize;
    let rgba_size = (pixel_count * 4) as u64;

    let rgba = unsafe {
        let ptr = dev
            .dev
            .map_memory(memory, 0, rgba_size, vk::MemoryMapFlags::empty())
            .map_err(|_| DvzError::ResourceExhausted("board map for PNG capture".to_string()))?;
        let mut out = vec![0u8; rgba_size as usize];
        std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), rgba_size as usize);
        dev.dev.unmap_memory(memory);
        out
    };

    // R8G8B8A8 board format (3.4) -> tightly packed RGB8 (6.3).
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for px in rgba.chunks_exact(4) {
        rgb.extend_from_slice(&px[0..3]);
    }

    let file = File::create(path).map_err(|e| DvzError::Other(e.to_string()))?;
    let w = BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, resolution.width, resolution.height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| DvzError::Other(e.to_string()))?;
    writer
        .write_image_data(&rgb)
        .map_err(|e| DvzError::Other(e.to_string()))?;
    Ok(())
}
