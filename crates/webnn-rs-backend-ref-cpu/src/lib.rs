//! Reference CPU backend for webnn-rs.
//!
//! Executes native graphs in host memory with straightforward kernels. It favors clarity over
//! speed and serves as the semantic baseline other backends are tested against.

pub mod cpu;
pub mod kernels;

pub use cpu::CpuBackend;
pub use kernels::CpuTensor;

/// Register the CPU backend with the global backend registry under `"cpu"`.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
pub fn register_cpu_backend() {
    webnn_rs::registry::register_native_backend("cpu", CpuBackend::new);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
