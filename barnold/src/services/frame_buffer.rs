use crate::models::error::IprError;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use tracing::warn;

const CHANNELS: usize = 4;

/// Identifies one shared pixel region. The backing store is a file of
/// `width * height * 4 * size_of::<f32>()` bytes under the OS temp
/// directory, memory-mapped by both processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBufferDescriptor {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl FrameBufferDescriptor {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS * std::mem::size_of::<f32>()
    }
}

fn region_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(name)
}

/// Row-major RGBA float image shared between the controller and the
/// worker. No lock guards the pixels: the redraw notifier is the
/// happens-after signal, and a torn read is repaired by the next wake.
pub struct FrameBuffer {
    descriptor: FrameBufferDescriptor,
    map: MmapMut,
    _file: File,
}

impl FrameBuffer {
    /// Allocate the zero-filled backing file and map it. Fails if the name
    /// is already taken or the region cannot be created.
    pub fn create(descriptor: &FrameBufferDescriptor) -> Result<Self, IprError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(IprError::Resource(format!(
                "frame buffer {} has a zero dimension",
                descriptor.name
            )));
        }
        let path = region_path(&descriptor.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| IprError::Resource(format!("region directory: {e}")))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| IprError::Resource(format!("region {}: {e}", descriptor.name)))?;
        file.set_len(descriptor.byte_len() as u64)
            .map_err(|e| IprError::Resource(format!("region {}: {e}", descriptor.name)))?;
        Self::map(descriptor, file)
    }

    /// Map an existing region created by the other side.
    pub fn open(descriptor: &FrameBufferDescriptor) -> Result<Self, IprError> {
        let path = region_path(&descriptor.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| IprError::Resource(format!("region {}: {e}", descriptor.name)))?;
        let len = file
            .metadata()
            .map_err(|e| IprError::Resource(format!("region {}: {e}", descriptor.name)))?
            .len();
        if (len as usize) < descriptor.byte_len() {
            return Err(IprError::Resource(format!(
                "region {} is {len} bytes, expected {}",
                descriptor.name,
                descriptor.byte_len()
            )));
        }
        Self::map(descriptor, file)
    }

    fn map(descriptor: &FrameBufferDescriptor, file: File) -> Result<Self, IprError> {
        // Sound: the file stays open for the mapping's lifetime and was
        // sized to byte_len above.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| IprError::Resource(format!("mapping {}: {e}", descriptor.name)))?;
        Ok(FrameBuffer {
            descriptor: descriptor.clone(),
            map,
            _file: file,
        })
    }

    pub fn descriptor(&self) -> &FrameBufferDescriptor {
        &self.descriptor
    }

    /// The whole image as `[height][width][4]` floats, without copying.
    pub fn pixels(&self) -> &[f32] {
        bytemuck::cast_slice(&self.map[..self.descriptor.byte_len()])
    }

    fn pixels_mut(&mut self) -> &mut [f32] {
        let len = self.descriptor.byte_len();
        bytemuck::cast_slice_mut(&mut self.map[..len])
    }

    /// Copy a finished tile into place, scanline by scanline. Clamps to the
    /// buffer bounds: a stale tile delivered across a resize must never
    /// write out of range.
    pub fn write_tile(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[f32]) {
        let (x, y) = (x as usize, y as usize);
        let (tile_w, tile_h) = (width as usize, height as usize);
        if data.len() < tile_w * tile_h * CHANNELS {
            warn!(
                "tile {}x{} carried {} floats, expected {}; dropping",
                tile_w,
                tile_h,
                data.len(),
                tile_w * tile_h * CHANNELS
            );
            return;
        }
        let buf_w = self.descriptor.width as usize;
        let buf_h = self.descriptor.height as usize;
        if x >= buf_w || y >= buf_h {
            return;
        }
        let copy_w = tile_w.min(buf_w - x);
        let copy_h = tile_h.min(buf_h - y);
        let pixels = self.pixels_mut();
        for row in 0..copy_h {
            let src = row * tile_w * CHANNELS;
            let dst = ((y + row) * buf_w + x) * CHANNELS;
            pixels[dst..dst + copy_w * CHANNELS]
                .copy_from_slice(&data[src..src + copy_w * CHANNELS]);
        }
    }

    /// Delete the backing file. Existing mappings on either side stay
    /// valid until they are dropped.
    pub fn remove_backing(descriptor: &FrameBufferDescriptor) -> io::Result<()> {
        fs::remove_file(region_path(&descriptor.name))
    }
}
