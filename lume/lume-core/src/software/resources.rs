use super::kernel::ComputeKernel;
use crate::backend::{NativePipeline, NativeResource};
use crate::resource::ResourceKind;
use crate::{ClearColor, ShaderMetadata, TextureFormat};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host memory standing in for a GPU buffer.
#[derive(Debug)]
pub struct SoftwareBuffer {
    data: Mutex<Vec<u8>>,
    host_visible: bool,
}

impl SoftwareBuffer {
    pub(crate) fn new(size: u64, host_visible: bool) -> Self {
        Self {
            data: Mutex::new(vec![0; size as usize]),
            host_visible,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the host may map this buffer.
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) {
        lock(&self.data)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&lock(&self.data)[offset..offset + out.len()]);
    }

    pub(crate) fn load_u32(&self, element: usize) -> Option<u32> {
        let data = lock(&self.data);
        let start = element.checked_mul(4)?;
        let bytes = data.get(start..start + 4)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn store_u32(&self, element: usize, value: u32) -> Option<()> {
        let mut data = lock(&self.data);
        let start = element.checked_mul(4)?;
        data.get_mut(start..start + 4)?
            .copy_from_slice(bytemuck::bytes_of(&value));
        Some(())
    }

    /// Copies `size` bytes between buffers. `src` and `dst` may be the same buffer.
    pub(crate) fn copy(src: &Self, src_offset: usize, dst: &Self, dst_offset: usize, size: usize) {
        if std::ptr::eq(src, dst) {
            lock(&src.data).copy_within(src_offset..src_offset + size, dst_offset);
            return;
        }
        let staged = lock(&src.data)[src_offset..src_offset + size].to_vec();
        lock(&dst.data)[dst_offset..dst_offset + size].copy_from_slice(&staged);
    }
}

impl NativeResource for SoftwareBuffer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Linear texel storage. Only the first mip is kept.
#[derive(Debug)]
pub struct SoftwareTexture {
    pub(crate) format: TextureFormat,
    pub(crate) size: (u32, u32, u32),
    texels: Mutex<Vec<u8>>,
}

impl SoftwareTexture {
    pub(crate) fn new(format: TextureFormat, size: (u32, u32, u32)) -> Self {
        let bytes = size.0 as usize * size.1 as usize * size.2.max(1) as usize
            * format.bytes_per_texel() as usize;
        Self {
            format,
            size,
            texels: Mutex::new(vec![0; bytes]),
        }
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32, u32) {
        self.size
    }

    /// Copy of the texel bytes.
    pub fn texels(&self) -> Vec<u8> {
        lock(&self.texels).clone()
    }

    /// Fills every texel with `color`. Returns `false` for formats the software
    /// backend cannot encode.
    pub(crate) fn clear(&self, color: ClearColor) -> bool {
        let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        let texel: Vec<u8> = match self.format {
            TextureFormat::Rgba8Unorm => {
                vec![unorm(color.r), unorm(color.g), unorm(color.b), unorm(color.a)]
            }
            TextureFormat::Bgra8Unorm => {
                vec![unorm(color.b), unorm(color.g), unorm(color.r), unorm(color.a)]
            }
            TextureFormat::R32Float | TextureFormat::D32Float => {
                bytemuck::bytes_of(&color.r).to_vec()
            }
            TextureFormat::R32Uint => bytemuck::bytes_of(&(color.r as u32)).to_vec(),
            TextureFormat::Rgba32Float => {
                bytemuck::cast_slice(&[color.r, color.g, color.b, color.a]).to_vec()
            }
            TextureFormat::Rgba16Float => return false,
        };
        for chunk in lock(&self.texels).chunks_exact_mut(texel.len()) {
            chunk.copy_from_slice(&texel);
        }
        true
    }
}

impl NativeResource for SoftwareTexture {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Texture
    }

    fn size_bytes(&self) -> u64 {
        lock(&self.texels).len() as u64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) enum SoftwarePipeline {
    Compute {
        kernel: Arc<dyn ComputeKernel>,
        metadata: ShaderMetadata,
    },
    Graphics {
        vertex: Arc<dyn ComputeKernel>,
        has_fragment: bool,
    },
}

impl std::fmt::Debug for SoftwarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SoftwarePipeline::Compute { metadata, .. } => f
                .debug_struct("Compute")
                .field("metadata", metadata)
                .finish_non_exhaustive(),
            SoftwarePipeline::Graphics { has_fragment, .. } => f
                .debug_struct("Graphics")
                .field("has_fragment", has_fragment)
                .finish_non_exhaustive(),
        }
    }
}

impl NativePipeline for SoftwarePipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_through_bytes() {
        let buffer = SoftwareBuffer::new(16, true);
        buffer.store_u32(2, 0xDEAD_BEEF).unwrap();
        assert_eq!(buffer.load_u32(2), Some(0xDEAD_BEEF));
        assert_eq!(buffer.load_u32(4), None);
        assert!(buffer.store_u32(4, 1).is_none());
    }

    #[test]
    fn overlapping_copy_within_one_buffer() {
        let buffer = SoftwareBuffer::new(8, true);
        buffer.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        SoftwareBuffer::copy(&buffer, 0, &buffer, 2, 4);
        let mut out = [0u8; 8];
        buffer.read(0, &mut out);
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn clear_encodes_unorm() {
        let tex = SoftwareTexture::new(TextureFormat::Bgra8Unorm, (2, 1, 1));
        assert!(tex.clear(ClearColor {
            r: 1.0,
            g: 0.5,
            b: 0.0,
            a: 1.0
        }));
        assert_eq!(tex.texels(), vec![0, 128, 255, 255, 0, 128, 255, 255]);
    }
}
