//! Error types for SSFX.
//!
//! Recoverable conditions (out-of-range indices, truncated gradients, empty
//! emitter lists) never surface here; they are logged with the `[ssfx]`
//! prefix and absorbed where they are detected. What remains are the fatal
//! cases: a buffer that could not be created, or a GPU that could not be
//! reached at all.

use thiserror::Error;

/// Errors raised by a [`GpuBackend`](crate::gpu::GpuBackend).
#[derive(Debug, Error)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    #[error("no compatible GPU adapter found; ensure your system has a GPU with WebGPU/Vulkan/Metal/DX12 support")]
    NoAdapter,
    /// Failed to create GPU device.
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),
    /// A buffer of the requested size could not be created.
    #[error("cannot allocate buffer `{label}` of {size} bytes (limit {limit})")]
    OutOfMemory {
        label: String,
        size: u64,
        limit: u64,
    },
    /// A zero-sized buffer was requested.
    #[error("buffer `{0}` requested with zero size")]
    ZeroSized(String),
    /// The handle does not name a live buffer.
    #[error("unknown buffer handle {0}")]
    UnknownBuffer(u32),
    /// An upload would write past the end of the buffer.
    #[error("write of {len} bytes at offset {offset} overflows buffer of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    /// A kernel was dispatched without a buffer it reads.
    #[error("kernel `{kernel}` dispatched without binding {binding}")]
    MissingBinding { kernel: String, binding: u32 },
    /// A kernel's WGSL failed to compile or validate.
    #[error("kernel `{label}` rejected: {message}")]
    InvalidKernel { label: String, message: String },
    /// Failed to map buffer for reading.
    #[error("failed to map GPU buffer: {0}")]
    BufferMapping(String),
}

/// Errors that can occur during noise map loading.
#[derive(Debug, Error)]
pub enum TextureError {
    /// Failed to load image file.
    #[error("failed to load image: {0}")]
    ImageLoad(#[from] image::ImageError),
    /// Failed to read file from disk.
    #[error("failed to read texture file: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for pipeline frames and settings loading.
#[derive(Debug, Error)]
pub enum Error {
    /// A required buffer could not be allocated; the frame was abandoned.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[source] GpuError),
    /// Any other backend failure.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    /// Noise map could not be loaded.
    #[error(transparent)]
    Texture(#[from] TextureError),
    /// Settings file could not be parsed.
    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an allocation failure, keeping other backend errors as they are.
    pub fn allocation(e: GpuError) -> Self {
        match e {
            GpuError::OutOfMemory { .. } | GpuError::ZeroSized(_) => Error::Allocation(e),
            other => Error::Gpu(other),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_errors_are_classified() {
        let e = Error::allocation(GpuError::OutOfMemory {
            label: "particles".into(),
            size: 10,
            limit: 4,
        });
        assert!(matches!(e, Error::Allocation(_)));

        let e = Error::allocation(GpuError::UnknownBuffer(3));
        assert!(matches!(e, Error::Gpu(GpuError::UnknownBuffer(3))));
    }

    #[test]
    fn messages_name_the_buffer() {
        let e = GpuError::OutOfMemory {
            label: "configs".into(),
            size: 864,
            limit: 100,
        };
        assert!(e.to_string().contains("configs"));
    }
}
