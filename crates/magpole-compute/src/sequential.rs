//! Single-threaded reference backend.

use crate::backend::{row_buffer_len, BackendType, ComputeBackend, ComputeError, DeviceInfo};

/// Backend that evaluates rows one after another on the calling thread.
///
/// This is the reference every other backend is compared against.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialBackend;

impl SequentialBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for SequentialBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Sequential (1 thread)".into(),
            backend_type: BackendType::Sequential,
            memory_bytes: None,
            compute_units: Some(1),
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
        for (row, out) in data.chunks_exact_mut(width).enumerate() {
            row_fn(row, out);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_written_in_place() {
        let backend = SequentialBackend::new();
        let data = backend
            .parallel_rows(3, 2, &|row, out| {
                out[0] = row as f64;
                out[1] = 10.0 * row as f64;
            })
            .unwrap();
        assert_eq!(data, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]);
    }

    #[test]
    fn test_zero_width_yields_empty_buffer() {
        let backend = SequentialBackend::new();
        let data = backend.parallel_rows(5, 0, &|_, _| {}).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_device_info_reports_sequential() {
        let info = SequentialBackend::new().device_info();
        assert_eq!(info.backend_type, BackendType::Sequential);
        assert_eq!(info.compute_units, Some(1));
    }
}
