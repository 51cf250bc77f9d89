use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use tracejit::{compile_default, Array, Function};

const THREADS: usize = 8;

#[test]
fn concurrent_callers_share_one_trace() -> Result<()> {
    tracejit_backend_ref_cpu::register_cpu_backend();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let f = Function::unary(move |x| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        x.mul(x)?.add_scalar(1.0)
    });
    let compiled = compile_default(&f);
    let barrier = Barrier::new(THREADS);

    let results: Vec<Vec<f32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| -> Result<Vec<f32>> {
                    let x = Array::from_f32(&[1.0, 2.0, 3.0], &[3])?;
                    barrier.wait();
                    compiled.call_arrays(&[x])?[0].to_vec_f32()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("caller thread panicked"))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    for values in &results {
        ensure!(values == &vec![2.0, 5.0, 10.0], "{values:?}");
    }
    ensure!(runs.load(Ordering::SeqCst) == 1);
    let stats = compiled.stats();
    ensure!(stats.traces == 1, "{stats:?}");
    ensure!(stats.entries == 1, "{stats:?}");
    ensure!(stats.hits == THREADS - 1, "{stats:?}");
    Ok(())
}
