/// Device drivers

pub mod char;
pub mod scsi;

// Mock devices and capabilities for host-side testing
#[cfg(any(test, feature = "mock-devices"))]
pub mod mock;
