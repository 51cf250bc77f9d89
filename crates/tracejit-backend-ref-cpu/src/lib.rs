pub mod cpu;

use std::sync::Arc;

pub use cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend, NoopInterceptor,
    TensorData,
};

/// Register the CPU backend with the global backend registry.
///
/// Registration also runs from a static initializer on Linux. Calling it again
/// replaces the constructor with an identical one.
pub fn register_cpu_backend() {
    tracejit::backend::registry::register_backend("cpu", || {
        Arc::new(CpuPortableBackend::new()) as Arc<dyn tracejit::PortableBackend>
    });
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
