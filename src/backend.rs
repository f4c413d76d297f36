//! Compute backend selected at build time
//!
//! `ndarray` (CPU) is the default feature; `cuda` switches every binary and
//! the library defaults to the GPU.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("enable the `ndarray` or the `cuda` feature");

/// Backend used for fitting; prediction runs on [`DefaultBackend`]
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device type shared by both backends
pub type DefaultDevice = <DefaultBackend as Backend>::Device;

/// Label shown in the CLI banner
#[cfg(feature = "cuda")]
pub const BACKEND_NAME: &str = "CUDA (GPU)";

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub const BACKEND_NAME: &str = "NdArray (CPU)";

pub fn default_device() -> DefaultDevice {
    DefaultDevice::default()
}

pub fn backend_name() -> &'static str {
    BACKEND_NAME
}
