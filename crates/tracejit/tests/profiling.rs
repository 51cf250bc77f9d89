#![cfg(feature = "profiler")]

use anyhow::{anyhow, ensure, Result};
use tracejit::{compile_default, profiling, Array, Function};

#[test]
fn cache_counters_and_pass_timings_are_reported() -> Result<()> {
    tracejit_backend_ref_cpu::register_cpu_backend();
    profiling::reset();

    let compiled = compile_default(&Function::unary(|x| x.exp()?.mul_scalar(2.0)?.add(x)));
    let x = Array::from_f32(&[1.0, 2.0], &[2])?;
    for _ in 0..3 {
        compiled.call_arrays(&[x.clone()])?;
    }

    let report = profiling::take_report().ok_or_else(|| anyhow!("profiler disabled"))?;
    ensure!(report.cache_count("compile_cache_miss") == Some(1));
    ensure!(report.cache_count("compile_cache_hit") == Some(2));
    ensure!(report.compile.iter().any(|row| row.name == "trace"));
    ensure!(report
        .passes
        .iter()
        .any(|row| row.name == "elementwise-fusion" && row.calls >= 1));

    let json = profiling::take_report_json().ok_or_else(|| anyhow!("profiler disabled"))?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    ensure!(value.get("cache").is_some());
    Ok(())
}
