use std::fmt;

// Device — Where a buffer's storage lives
//
// The original runtime addressed devices with integer ranges
// (CPU, GPU 0..8, FPGA 0..8). A closed enum keeps the same address space
// but makes invalid ids unrepresentable past the validity check, and lets
// dispatch match on residency instead of comparing magic ranges.
//
// Compute kernels in this workspace are host kernels: a buffer resident on
// an accelerator can be moved, copied, and introspected, but dispatching a
// host kernel on it fails with DeviceMismatch. Accelerator backends are an
// external collaborator's concern; the residency contract is not.

/// Maximum number of accelerators of each kind that can be addressed.
pub const MAX_ACCELERATORS: usize = 8;

/// A compute device a buffer can be resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory.
    Cpu,
    /// GPU with the given index (`0..MAX_ACCELERATORS`).
    Gpu(usize),
    /// FPGA with the given index (`0..MAX_ACCELERATORS`).
    Fpga(usize),
}

impl Device {
    /// Whether this is the host device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a GPU device.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    /// Whether this is an FPGA device.
    pub fn is_fpga(&self) -> bool {
        matches!(self, Device::Fpga(_))
    }

    /// Whether the device id is within the addressable range.
    pub fn is_valid(&self) -> bool {
        match self {
            Device::Cpu => true,
            Device::Gpu(id) | Device::Fpga(id) => *id < MAX_ACCELERATORS,
        }
    }

    /// A human-readable name for this device (e.g. "cpu", "gpu:0").
    pub fn name(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Gpu(id) => format!("gpu:{id}"),
            Device::Fpga(id) => format!("fpga:{id}"),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
