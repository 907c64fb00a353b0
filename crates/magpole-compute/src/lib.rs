//! # Magpole Compute
//!
//! Compute backend abstraction for the magpole multipole operator. This crate
//! provides a [`ComputeBackend`](backend::ComputeBackend) trait that isolates
//! the field kernels from device-specific execution details.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Status |
//! |---------|-------------|--------|
//! | Sequential | always | Reference |
//! | CPU (Rayon) | `cpu` (default) | Implemented |
//! | GPU (wgpu, f64) | `gpu` | Implemented, needs `SHADER_F64` |

pub mod backend;
pub mod sequential;

#[cfg(feature = "cpu")]
pub mod cpu;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use backend::{
    BackendType, ComputeBackend, ComputeError, DeviceInfo, KernelDirection, KernelGeometry,
};
pub use sequential::SequentialBackend;

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;

#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;
