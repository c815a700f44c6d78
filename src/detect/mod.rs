mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectorBackend, DetectorOpener};
pub use backends::CpuBackend;
pub use registry::BackendRegistry;
pub use result::{Detection, Region};
