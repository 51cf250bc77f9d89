use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, ensure, Result};
use tracejit::compile::cache;
use tracejit::{compile_default, Array, Function};

static TEST_MUTEX: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    tracejit_backend_ref_cpu::register_cpu_backend();
    TEST_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn dropping_wrappers_releases_partitions_and_graphs() -> Result<()> {
    let _guard = setup();
    let partitions_before = cache::live_partitions();
    let graphs_before = cache::live_graphs();

    for step in 0..50 {
        let captured = Array::from_f32(&[step as f32; 4], &[4])?;
        let f = Function::unary(move |x| x.mul(&captured)?.exp());
        let compiled = compile_default(&f);
        let out = compiled.call_arrays(&[Array::ones(&[4], tracejit::DType::F32)?])?;
        out[0].eval()?;
    }

    ensure!(cache::live_partitions() == partitions_before);
    ensure!(cache::live_graphs() == graphs_before);
    Ok(())
}

#[test]
fn partitions_live_as_long_as_some_wrapper() -> Result<()> {
    let _guard = setup();
    let before = cache::live_partitions();
    let f = Function::unary(|x| x.neg());
    let first = compile_default(&f);
    let second = compile_default(&f);
    ensure!(cache::live_partitions() == before + 1);

    first.call_arrays(&[Array::ones(&[2], tracejit::DType::F32)?])?;
    drop(first);
    ensure!(cache::live_partitions() == before + 1);
    ensure!(second.stats().entries == 1);

    drop(second);
    ensure!(cache::live_partitions() == before);
    Ok(())
}

#[test]
fn graphs_can_be_moved_between_wrapper_lifetimes() -> Result<()> {
    let _guard = setup();
    let f = Function::unary(|x| x.abs());
    let x = Array::from_f32(&[-1.0], &[1])?;
    let args = tracejit::args![&x];

    let compiled = compile_default(&f);
    compiled.call(args.clone())?;
    let signature = compiled.signature(&args)?;
    let graph = cache::lookup(f.id(), &signature).ok_or_else(|| anyhow!("graph missing"))?;
    drop(compiled);

    ensure!(cache::lookup(f.id(), &signature).is_none());
    ensure!(!cache::insert(f.id(), signature.clone(), Arc::clone(&graph)));

    let revived = compile_default(&f);
    ensure!(cache::insert(f.id(), signature, graph));
    let out = revived.call(args)?;
    ensure!(out.array()?.to_vec_f32()? == vec![1.0]);
    let stats = revived.stats();
    ensure!(stats.traces == 0 && stats.hits == 1, "{stats:?}");
    Ok(())
}
