//! Emulated accelerator whose memory lives in host RAM.

use crate::error::{Error, ErrorKind, Result};

/// Host-memory device with an optional capacity limit.
#[derive(Debug, Clone)]
pub struct HostDevice {
    capacity: Option<usize>,
}

impl HostDevice {
    pub fn new(capacity: Option<usize>) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Allocate `len` zeroed bytes given `in_use` bytes already live.
    pub(crate) fn alloc(&self, len: usize, in_use: usize) -> Result<Vec<u8>> {
        if let Some(capacity) = self.capacity {
            if in_use.saturating_add(len) > capacity {
                return Err(Error::new(
                    ErrorKind::DeviceOutOfMemory,
                    format!(
                        "emulated device capacity exceeded: {in_use} in use + {len} requested > {capacity}"
                    ),
                ));
            }
        }

        let mut mem = Vec::new();
        mem.try_reserve_exact(len).map_err(|e| {
            Error::new(
                ErrorKind::DeviceOutOfMemory,
                format!("host allocator refused {len} bytes"),
            )
            .set_source(e)
        })?;
        mem.resize(len, 0);
        Ok(mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let dev = HostDevice::new(None);
        let mem = dev.alloc(100, 0).unwrap();
        assert_eq!(mem.len(), 100);
        assert!(mem.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_capacity_counts_bytes_in_use() {
        let dev = HostDevice::new(Some(100));
        assert!(dev.alloc(100, 0).is_ok());
        let err = dev.alloc(1, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceOutOfMemory);
    }

    #[test]
    fn test_unbounded_capacity() {
        let dev = HostDevice::new(None);
        assert_eq!(dev.capacity(), None);
        assert!(dev.alloc(1 << 16, usize::MAX / 2).is_ok());
    }
}
