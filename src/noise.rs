//! Noise map sampled by the simulation kernel to modulate wind.

use std::path::Path;

use crate::error::{Error, Result, TextureError};
use crate::gpu::{BufferDesc, BufferHandle, GpuBackend};

/// Single-channel noise stored row by row, values in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct NoiseMap {
    values: Vec<f32>,
    width: u32,
    height: u32,
}

impl NoiseMap {
    /// Build from raw values. Returns `None` if the sizes disagree.
    pub fn from_values(values: Vec<f32>, width: u32, height: u32) -> Option<Self> {
        if values.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { values, width, height })
    }

    /// Luminance of an 8-bit RGBA image.
    pub fn from_rgba(data: &[u8], width: u32, height: u32) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) * 4 {
            return None;
        }
        let values = data
            .chunks_exact(4)
            .map(|px| luminance(px[0], px[1], px[2]))
            .collect();
        Self::from_values(values, width, height)
    }

    /// Load an image file (PNG or JPEG).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(TextureError::Io)?;
        let img = image::load_from_memory(&bytes)
            .map_err(TextureError::ImageLoad)?
            .into_rgba8();
        let (width, height) = img.dimensions();
        log::info!(
            "[ssfx] loaded noise map {} ({}x{})",
            path.as_ref().display(),
            width,
            height
        );
        let values = img.pixels().map(|p| luminance(p[0], p[1], p[2])).collect();
        Ok(Self { values, width, height })
    }

    /// Hash noise, handy when no texture is available.
    pub fn procedural(size: u32, seed: u32) -> Self {
        let values = (0..size)
            .flat_map(|y| (0..size).map(move |x| hash_noise(x, y, seed) as f32 / 255.0))
            .collect();
        Self {
            values,
            width: size,
            height: size,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Allocate a storage buffer holding the values.
    pub fn upload<B: GpuBackend + ?Sized>(&self, backend: &mut B) -> Result<BufferHandle> {
        let count = self.values.len().max(1) as u32;
        let handle = backend
            .allocate(&BufferDesc::storage("Noise Map", count, 4))
            .map_err(Error::allocation)?;
        if !self.values.is_empty() {
            backend.upload(handle, 0, bytemuck::cast_slice(&self.values))?;
        }
        Ok(handle)
    }
}

fn luminance(r: u8, g: u8, b: u8) -> f32 {
    (0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32) / 255.0
}

fn hash_noise(x: u32, y: u32, seed: u32) -> u8 {
    let mut h = x.wrapping_mul(374761393);
    h = h.wrapping_add(y.wrapping_mul(668265263));
    h = h.wrapping_add(seed.wrapping_mul(1013904223));
    h = (h ^ (h >> 13)).wrapping_mul(1274126177);
    (h ^ (h >> 16)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    #[test]
    fn test_rgba_luminance() {
        let map = NoiseMap::from_rgba(&[255, 255, 255, 255, 0, 0, 0, 255], 2, 1).expect("map");
        assert!((map.values()[0] - 1.0).abs() < 1e-5);
        assert_eq!(map.values()[1], 0.0);
        assert!(NoiseMap::from_rgba(&[0; 7], 2, 1).is_none());
    }

    #[test]
    fn test_procedural_is_deterministic() {
        let a = NoiseMap::procedural(8, 3);
        assert_eq!(a, NoiseMap::procedural(8, 3));
        assert_ne!(a, NoiseMap::procedural(8, 4));
        assert!(a.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_upload() {
        let mut backend = SoftwareBackend::new();
        let map = NoiseMap::from_values(vec![0.25, 0.5], 2, 1).expect("map");
        let handle = map.upload(&mut backend).expect("upload");
        assert_eq!(backend.contents::<f32>(handle), Some(&[0.25, 0.5][..]));
    }

    #[test]
    fn test_missing_file() {
        let err = NoiseMap::from_file("does/not/exist.png").unwrap_err();
        assert!(matches!(err, Error::Texture(TextureError::Io(_))));
    }
}
