use stoat_core::{Device, Error, Result};

// ComputeService — Where a network runs
//
// A ComputeService names the devices a network is replicated onto (one
// replica per device) and the size of the thread pool that drives them.
// `local_cpu(n)` is the common case: n CPU-bound replicas on worker
// threads, data-parallel over the batch.

/// Upper bound on replica workers.
pub const MAX_WORKERS: usize = 1024;

/// Device set and thread budget for a network.
#[derive(Debug, Clone)]
pub struct ComputeService {
    devices: Vec<Device>,
    threads: usize,
}

impl ComputeService {
    /// `workers` CPU-bound replicas. The count is clamped to
    /// `1..=MAX_WORKERS`.
    pub fn local_cpu(workers: usize) -> Self {
        let workers = workers.clamp(1, MAX_WORKERS);
        ComputeService {
            devices: vec![Device::Cpu; workers],
            threads: workers,
        }
    }

    /// One replica per listed device.
    pub fn devices(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::msg("compute service needs at least one device"));
        }
        if devices.len() > MAX_WORKERS {
            return Err(Error::msg(format!(
                "{} devices exceed the {} worker cap",
                devices.len(),
                MAX_WORKERS
            )));
        }
        for d in &devices {
            if !d.is_valid() {
                return Err(Error::Allocation {
                    device: *d,
                    reason: "device id out of range".to_string(),
                });
            }
        }
        let threads = devices.len();
        Ok(ComputeService { devices, threads })
    }

    pub fn device_list(&self) -> &[Device] {
        &self.devices
    }

    pub fn replica_count(&self) -> usize {
        self.devices.len()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_cpu_clamps() {
        assert_eq!(ComputeService::local_cpu(0).replica_count(), 1);
        assert_eq!(ComputeService::local_cpu(4).replica_count(), 4);
        assert_eq!(
            ComputeService::local_cpu(MAX_WORKERS + 5).replica_count(),
            MAX_WORKERS
        );
    }

    #[test]
    fn test_device_list_validation() {
        assert!(ComputeService::devices(vec![]).is_err());
        assert!(ComputeService::devices(vec![Device::Gpu(9)]).is_err());
        let cs = ComputeService::devices(vec![Device::Cpu, Device::Gpu(0)]).unwrap();
        assert_eq!(cs.replica_count(), 2);
    }
}
