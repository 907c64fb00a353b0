//! GPU compute backend via wgpu.
//!
//! Implements [`ComputeBackend`] using a WGSL compute shader that evaluates
//! the multipole Bz kernel directly on the device, without ever forming the
//! sensor × moment matrix.
//!
//! # Precision
//!
//! The shader runs in f64 and therefore needs an adapter exposing
//! [`wgpu::Features::SHADER_F64`]. The operator's tolerance contract with the
//! CPU backends (1e-9 relative) cannot be met in f32: the octupole prefactor
//! $10^{-7}/r^9$ underflows single precision at micrometre distances.
//!
//! # Geometry caching
//!
//! Source and sensor positions are uploaded once and reused for every
//! forward/adjoint call of an inversion run (hundreds of calls per solve).
//! They are re-uploaded only when the positions change.
//!
//! # Threading
//!
//! One invocation owns one outer-axis element: a sensor for the forward map,
//! a source for the adjoint. This mirrors the row contract of the CPU
//! backends.

use std::borrow::Cow;
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::backend::{
    row_buffer_len, BackendType, ComputeBackend, ComputeError, DeviceInfo, KernelDirection,
    KernelGeometry,
};

/// Invocations per workgroup; must match `@workgroup_size` in the shader.
const WORKGROUP_SIZE: u32 = 64;

/// Uniform buffer parameters passed to the WGSL shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct ShaderParams {
    n_sensors: u32,
    n_sources: u32,
    n_orders: u32,
    n_cols: u32,
    mu0_reduced: f64,
    _pad: f64,
}

/// Device copies of the positions from the last call.
struct CachedGeometry {
    sources: wgpu::Buffer,
    sensors: wgpu::Buffer,
    host_sources: Vec<[f64; 3]>,
    host_sensors: Vec<[f64; 3]>,
}

/// GPU compute backend using wgpu.
///
/// Holds the device, queue and the two compiled entry points (forward and
/// adjoint) of the multipole shader.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    forward_pipeline: wgpu::ComputePipeline,
    adjoint_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    device_name: String,
    max_binding_bytes: u64,
    max_workgroups: u32,
    cached_geometry: Mutex<Option<CachedGeometry>>,
}

impl GpuBackend {
    /// Create a new GPU backend asynchronously.
    ///
    /// Requests a high-performance adapter and fails with
    /// [`ComputeError::Unavailable`] if none is found or if it lacks f64
    /// shader support.
    pub async fn new_async() -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| ComputeError::Unavailable("No GPU adapter found".into()))?;

        let device_name = adapter.get_info().name.clone();

        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            return Err(ComputeError::Unavailable(format!(
                "Adapter '{}' does not support f64 shaders",
                device_name
            )));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("magpole-compute"),
                    required_features: wgpu::Features::SHADER_F64,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ComputeError::DeviceError(format!("Failed to create device: {}", e)))?;

        let limits = device.limits();
        let max_binding_bytes = u64::from(limits.max_storage_buffer_binding_size);
        let max_workgroups = limits.max_compute_workgroups_per_dimension;

        let shader_source = include_str!("shaders/multipole_bz.wgsl");
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("multipole_bz_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shader_source)),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("multipole_bind_group_layout"),
                entries: &[
                    // binding 0: source positions
                    storage_entry(0, true),
                    // binding 1: sensor positions
                    storage_entry(1, true),
                    // binding 2: input vector
                    storage_entry(2, true),
                    // binding 3: output vector
                    storage_entry(3, false),
                    // binding 4: params uniform
                    wgpu::BindGroupLayoutEntry {
                        binding: 4,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("multipole_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        let forward_pipeline = make_pipeline("forward_main");
        let adjoint_pipeline = make_pipeline("adjoint_main");

        log::debug!("GPU backend ready on '{}'", device_name);

        Ok(Self {
            device,
            queue,
            forward_pipeline,
            adjoint_pipeline,
            bind_group_layout,
            device_name,
            max_binding_bytes,
            max_workgroups,
            cached_geometry: Mutex::new(None),
        })
    }

    /// Create a new GPU backend, blocking the current thread.
    ///
    /// Convenience wrapper around [`new_async`](Self::new_async) using
    /// `pollster`.
    pub fn new_blocking() -> Result<Self, ComputeError> {
        pollster::block_on(Self::new_async())
    }

    fn storage_buffer(&self, label: &str, bytes: &[u8], usage: wgpu::BufferUsages) -> wgpu::Buffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.len() as u64,
            usage,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, bytes);
        buffer
    }

    fn check_binding_size(&self, bytes: u64) -> Result<(), ComputeError> {
        if bytes > self.max_binding_bytes {
            return Err(ComputeError::OutOfMemory {
                requested: bytes as usize,
                available: self.max_binding_bytes as usize,
            });
        }
        Ok(())
    }

    /// Upload positions unless the cached copies already match.
    fn ensure_geometry_uploaded(
        &self,
        cache: &mut Option<CachedGeometry>,
        geometry: &KernelGeometry<'_>,
    ) {
        if let Some(cached) = cache.as_ref() {
            if cached.host_sources == geometry.sources && cached.host_sensors == geometry.sensors {
                return;
            }
        }

        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let sources =
            self.storage_buffer("source_positions", bytemuck::cast_slice(geometry.sources), usage);
        let sensors =
            self.storage_buffer("sensor_positions", bytemuck::cast_slice(geometry.sensors), usage);

        *cache = Some(CachedGeometry {
            sources,
            sensors,
            host_sources: geometry.sources.to_vec(),
            host_sensors: geometry.sensors.to_vec(),
        });
    }

    /// Split `invocations` into a 2D dispatch that respects the per-dimension
    /// workgroup limit. The shader flattens `(x, y)` back into one index.
    fn dispatch_size(&self, invocations: usize) -> Result<(u32, u32), ComputeError> {
        let groups = (invocations as u64).div_ceil(u64::from(WORKGROUP_SIZE));
        let max = u64::from(self.max_workgroups);
        let x = groups.min(max);
        let y = groups.div_ceil(x.max(1));
        if y > max {
            return Err(ComputeError::DeviceError(format!(
                "{} invocations exceed the dispatch limit",
                invocations
            )));
        }
        Ok((x as u32, y as u32))
    }

    fn run_kernel(
        &self,
        geometry: &KernelGeometry<'_>,
        direction: KernelDirection,
        input: &[f64],
    ) -> Result<Vec<f64>, ComputeError> {
        let output_len = geometry.output_len(direction);
        let output_bytes = (output_len * std::mem::size_of::<f64>()) as u64;
        let input_bytes = std::mem::size_of_val(input) as u64;
        for bytes in [
            output_bytes,
            input_bytes,
            std::mem::size_of_val(geometry.sources) as u64,
            std::mem::size_of_val(geometry.sensors) as u64,
        ] {
            self.check_binding_size(bytes)?;
        }

        let invocations = match direction {
            KernelDirection::Forward => geometry.sensors.len(),
            KernelDirection::Adjoint => geometry.sources.len(),
        };
        let (groups_x, groups_y) = self.dispatch_size(invocations)?;

        let mut cache = self
            .cached_geometry
            .lock()
            .map_err(|_| ComputeError::DeviceError("GPU geometry cache poisoned".into()))?;
        self.ensure_geometry_uploaded(&mut cache, geometry);
        let cached = cache
            .as_ref()
            .ok_or_else(|| ComputeError::DeviceError("Geometry not uploaded to GPU".into()))?;

        let input_buffer = self.storage_buffer(
            "input_vec",
            bytemuck::cast_slice(input),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );

        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output_vec"),
            size: output_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: output_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params = ShaderParams {
            n_sensors: geometry.sensors.len() as u32,
            n_sources: geometry.sources.len() as u32,
            n_orders: geometry.orders as u32,
            n_cols: geometry.n_cols() as u32,
            mu0_reduced: geometry.mu0_reduced,
            _pad: 0.0,
        };
        let params_buffer = self.storage_buffer(
            "params",
            bytemuck::bytes_of(&params),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("multipole_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: cached.sources.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: cached.sensors.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: input_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("multipole_encoder"),
            });

        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("multipole_pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(match direction {
                KernelDirection::Forward => &self.forward_pipeline,
                KernelDirection::Adjoint => &self.adjoint_pipeline,
            });
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        // Drop the lock before blocking on device poll.
        drop(cache);

        let staging_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        staging_slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below; a failed send only means
            // the caller already gave up on this readback.
            let _ = sender.send(result);
        });

        let _ = self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|e| ComputeError::DeviceError(format!("Map recv failed: {}", e)))?
            .map_err(|e| ComputeError::DeviceError(format!("Buffer map failed: {}", e)))?;

        let data = staging_slice.get_mapped_range();
        let result: Vec<f64> = bytemuck::cast_slice::<u8, f64>(&data)[..output_len].to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(result)
    }
}

impl ComputeBackend for GpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("GPU ({})", self.device_name),
            backend_type: BackendType::Gpu,
            memory_bytes: None,
            compute_units: None,
        }
    }

    fn parallel_rows(
        &self,
        rows: usize,
        width: usize,
        row_fn: &(dyn Fn(usize, &mut [f64]) + Send + Sync),
    ) -> Result<Vec<f64>, ComputeError> {
        // Host closures cannot run on the device; generic row work stays on
        // the CPU (Rayon). The multipole kernel itself goes through
        // `multipole_kernel`.
        let mut data = vec![0.0; row_buffer_len(rows, width)?];
        if width == 0 {
            return Ok(data);
        }
        data.par_chunks_exact_mut(width)
            .enumerate()
            .for_each(|(row, out)| row_fn(row, out));
        Ok(data)
    }

    fn offloads_multipole_kernel(&self) -> bool {
        true
    }

    fn multipole_kernel(
        &self,
        geometry: &KernelGeometry<'_>,
        direction: KernelDirection,
        input: &[f64],
    ) -> Result<Vec<f64>, ComputeError> {
        if !(1..=3).contains(&geometry.orders) {
            return Err(ComputeError::DeviceError(format!(
                "Unsupported number of multipole orders: {}",
                geometry.orders
            )));
        }
        let expected = geometry.input_len(direction);
        if input.len() != expected {
            return Err(ComputeError::DeviceError(format!(
                "Dimension mismatch: kernel expects {} inputs, got {}",
                expected,
                input.len()
            )));
        }

        // Zero-sized bindings are invalid; an empty axis has an all-zero image.
        if geometry.sources.is_empty() || geometry.sensors.is_empty() {
            return Ok(vec![0.0; geometry.output_len(direction)]);
        }

        self.run_kernel(geometry, direction, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Try to create a GpuBackend. Skip the test if no GPU is available.
    fn try_gpu() -> Option<GpuBackend> {
        match GpuBackend::new_blocking() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                println!("Skipping: {}", e);
                None
            }
        }
    }

    // Dipole only; the quadrupole and octupole terms are checked column by
    // column against the core basis in magpole-core/tests/backend_equivalence.rs.
    fn dipole_bz_reference(sensor: [f64; 3], source: [f64; 3], m: [f64; 3]) -> f64 {
        let x = sensor[0] - source[0];
        let y = sensor[1] - source[1];
        let z = sensor[2] - source[2];
        let r2 = x * x + y * y + z * z;
        let f = 1e-7 / (r2 * r2 * r2.sqrt());
        f * (3.0 * x * z * m[0] + 3.0 * y * z * m[1] + (3.0 * z * z - r2) * m[2])
    }

    #[test]
    fn test_gpu_backend_creation() {
        match GpuBackend::new_blocking() {
            Ok(gpu) => {
                let info = gpu.device_info();
                assert_eq!(info.backend_type, BackendType::Gpu);
                assert!(gpu.offloads_multipole_kernel());
                println!("GPU backend created: {}", info.name);
            }
            Err(e) => {
                println!("GPU not available (expected in CI): {}", e);
            }
        }
    }

    #[test]
    fn test_gpu_dipole_forward_matches_closed_form() {
        let Some(gpu) = try_gpu() else { return };

        let sources = [[0.0, 0.0, -1e-6], [2e-6, 1e-6, -2e-6]];
        let sensors = [[0.0, 0.0, 1e-6], [1e-6, 1e-6, 1e-6], [3e-6, -1e-6, 1e-6]];
        let moments = [[1e-14, -2e-14, 3e-14], [0.5e-14, 0.0, -1e-14]];
        // Component-major: all mx, then all my, then all mz.
        let input: Vec<f64> = (0..3)
            .flat_map(|c| moments.iter().map(move |m| m[c]))
            .collect();

        let geometry = KernelGeometry {
            sources: &sources,
            sensors: &sensors,
            orders: 1,
            mu0_reduced: 1e-7,
        };
        let result = gpu
            .multipole_kernel(&geometry, KernelDirection::Forward, &input)
            .unwrap();

        for (i, sensor) in sensors.iter().enumerate() {
            let expected: f64 = sources
                .iter()
                .zip(moments.iter())
                .map(|(s, m)| dipole_bz_reference(*sensor, *s, *m))
                .sum();
            assert_relative_eq!(result[i], expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_gpu_rejects_wrong_input_length() {
        let Some(gpu) = try_gpu() else { return };
        let sources = [[0.0, 0.0, -1.0]];
        let sensors = [[0.0, 0.0, 1.0]];
        let geometry = KernelGeometry {
            sources: &sources,
            sensors: &sensors,
            orders: 2,
            mu0_reduced: 1e-7,
        };
        let err = gpu
            .multipole_kernel(&geometry, KernelDirection::Forward, &[1.0; 3])
            .unwrap_err();
        assert!(matches!(err, ComputeError::DeviceError(_)));
    }
}
