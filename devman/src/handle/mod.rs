pub mod common_cpu;
#[cfg(use_cuda)]
pub(crate) mod cuda;
