//! CPU compute backend using Rayon for shared-memory parallelism.

use rayon::prelude::*;

use crate::backend::{row_buffer_len, BackendType, ComputeBackend, ComputeError, DeviceInfo};

/// CPU backend that parallelises rows across threads via Rayon.
///
/// Each row is handed to exactly one worker, so the result is bit-identical
/// to [`SequentialBackend`](crate::SequentialBackend) regardless of the
/// thread count.
pub struct CpuBackend {
    num_threads: usize,
    /// Dedicated pool when a thread count was requested; `None` runs on the
    /// global Rayon pool.
    pool: Option<rayon::ThreadPool>,
}

impl CpuBackend {
    /// Create a new CPU backend using all available threads.
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            pool: None,
        }
    }

    /// Create a CPU backend with a dedicated pool of `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Result<Self, ComputeError> {
        if num_threads == 0 {
            return Err(ComputeError::Unavailable(
                "CPU backend needs at least one thread".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("magpole-cpu-{i}"))
            .build()
            .map_err(|e| ComputeError::DeviceError(e.to_string()))?;
        Ok(Self {
            num_threads,
            pool: Some(pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("CPU ({} threads)", self.num_threads),
            backend_type: BackendType::Cpu,
            memory_bytes: None,
            compute_units: Some(self.num_threads),
        }
    }

    fn parallel_rows(
        &self,
        rows: usize,
        width: usize,
        row_fn: &(dyn Fn(usize, &mut [f64]) + Send + Sync),
    ) -> Result<Vec<f64>, ComputeError> {
        let mut data = vec![0.0; row_buffer_len(rows, width)?];
        if width == 0 {
            return Ok(data);
        }

        let fill = |data: &mut [f64]| {
            data.par_chunks_exact_mut(width)
                .enumerate()
                .for_each(|(row, out)| row_fn(row, out));
        };
        match &self.pool {
            Some(pool) => pool.install(|| fill(&mut data)),
            None => fill(&mut data),
        }

        Ok(data)
    }
}
