// Property-based validation of the structural invariants the kernel
// core promises after every operation.

pub mod strategies;
