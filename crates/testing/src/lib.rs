// Host-side test suite for the kernel core: property-based coverage of
// the queue, pool, and emulator invariants, plus cross-subsystem
// scenarios that need a fully wired kernel.

pub mod property_based;

pub use charon_kernel::drivers::mock::mock_kernel;
