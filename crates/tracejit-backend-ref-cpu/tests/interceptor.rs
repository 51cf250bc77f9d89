use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use tracejit::backend::registry;
use tracejit::backend::spec::{BackendResult, Operation, PortableBackend, TensorSpec};
use tracejit::{compile_default, Array, Function};
use tracejit_backend_ref_cpu::{CpuKernelInterceptor, CpuTensor, GenericCpuBackend};

#[derive(Default)]
struct CountingInterceptor {
    matmuls: AtomicUsize,
}

impl CpuKernelInterceptor for CountingInterceptor {
    fn try_execute(
        &self,
        op: &Operation,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        if matches!(op, Operation::Matmul) {
            self.matmuls.fetch_add(1, Ordering::Relaxed);
        }
        None
    }
}

#[test]
fn compiled_graphs_run_on_an_intercepted_backend() -> Result<()> {
    let interceptor = Arc::new(CountingInterceptor::default());
    let shared = Arc::clone(&interceptor);
    registry::register_backend("cpu-counting", move || {
        Arc::new(GenericCpuBackend::with_arc(Arc::clone(&shared))) as Arc<dyn PortableBackend>
    });
    registry::set_default_backend("cpu-counting")?;

    let f = Function::binary(|a, b| a.matmul(b)?.tanh());
    let compiled = compile_default(&f);
    let a = Array::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2])?;
    let b = Array::from_f32(&[0.5, -0.5, 0.25, 0.0], &[2, 2])?;
    let out = compiled.call_arrays(&[a.clone(), b.clone()])?;
    let expected = b.tanh()?;
    ensure!(out[0].allclose(&expected, 1e-6, 1e-6)?);
    ensure!(interceptor.matmuls.load(Ordering::Relaxed) == 1);
    Ok(())
}
