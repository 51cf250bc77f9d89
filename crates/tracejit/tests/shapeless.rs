use anyhow::{ensure, Result};
use tracejit::{compile, Array, CompileError, CompileOptions, Function};

fn setup() {
    tracejit_backend_ref_cpu::register_cpu_backend();
}

fn iota(n: usize) -> Result<Array> {
    let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
    Array::from_f32(&values, &[n])
}

#[test]
fn new_extents_reuse_the_graph() -> Result<()> {
    setup();
    let f = Function::binary(|x, y| x.mul(y)?.exp()?.add_scalar(1.0));
    let compiled = compile(&f, CompileOptions::shapeless());

    for n in [2usize, 5, 3, 8] {
        let x = iota(n)?;
        let y = Array::scalar_f32(0.5)?;
        let expected = f.call_arrays(&[x.clone(), y.clone()])?;
        let out = compiled.call_arrays(&[x, y])?;
        ensure!(out[0].shape() == [n]);
        ensure!(out[0].allclose(&expected[0], 1e-6, 1e-6)?);
    }
    let stats = compiled.stats();
    ensure!(stats.traces == 1, "retraced for a new extent: {stats:?}");
    ensure!(stats.hits == 3);
    Ok(())
}

#[test]
fn inferred_reshape_and_reductions_follow_the_bound_shape() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.reshape(&[-1])?.sum(&[0], false));
    let compiled = compile(&f, CompileOptions::shapeless());

    let small = Array::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2])?;
    ensure!(compiled.call_arrays(&[small])?[0].item_f32()? == 10.0);
    let large = Array::from_f32(&[1.0; 12], &[3, 4])?;
    ensure!(compiled.call_arrays(&[large])?[0].item_f32()? == 12.0);
    ensure!(compiled.stats().traces == 1);
    Ok(())
}

#[test]
fn rank_or_dtype_changes_retrace() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.mul_scalar(2.0));
    let compiled = compile(&f, CompileOptions::shapeless());

    compiled.call_arrays(&[iota(3)?])?;
    let matrix = compiled.call_arrays(&[Array::ones(&[2, 2], tracejit::DType::F32)?])?;
    ensure!(matrix[0].to_vec_f32()? == vec![2.0; 4]);
    let ints = compiled.call_arrays(&[Array::from_i32(&[1, 2], &[2])?])?;
    ensure!(ints[0].to_vec_i32()? == vec![2, 4]);
    ensure!(compiled.stats().traces == 3);
    Ok(())
}

#[test]
fn incompatible_broadcast_is_a_shape_error() -> Result<()> {
    setup();
    let f = Function::binary(|x, y| x.add(y));
    let compiled = compile(&f, CompileOptions::shapeless());
    compiled.call_arrays(&[iota(2)?, iota(2)?])?;

    let err = match compiled.call_arrays(&[iota(3)?, iota(4)?]) {
        Ok(_) => anyhow::bail!("incompatible shapes were accepted"),
        Err(err) => err,
    };
    ensure!(
        matches!(err.downcast_ref::<CompileError>(), Some(CompileError::Shape { .. })),
        "unexpected error: {err:#}"
    );

    // The graph stays usable for compatible shapes.
    let out = compiled.call_arrays(&[iota(3)?, Array::scalar_f32(1.0)?.broadcast_to(&[3])?])?;
    ensure!(out[0].to_vec_f32()? == vec![1.0, 2.0, 3.0]);
    ensure!(compiled.stats().traces == 1);
    Ok(())
}

#[test]
fn shape_specific_graphs_are_not_shared_with_shapeless_ones() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.neg());
    let exact = tracejit::compile_default(&f);
    let shapeless = compile(&f, CompileOptions::shapeless());

    exact.call_arrays(&[iota(2)?])?;
    shapeless.call_arrays(&[iota(2)?])?;
    shapeless.call_arrays(&[iota(7)?])?;
    exact.call_arrays(&[iota(7)?])?;
    // One partition per function: two exact graphs plus one shapeless graph.
    ensure!(exact.stats().traces == 3);
    ensure!(exact.stats().entries == 3);
    Ok(())
}

#[test]
fn matmul_batch_dims_are_checked_on_bind() -> Result<()> {
    setup();
    let f = Function::binary(|a, b| a.matmul(b));
    let compiled = compile(&f, CompileOptions::shapeless());

    let a = Array::ones(&[2, 2, 3], tracejit::DType::F32)?;
    let b = Array::ones(&[2, 3, 4], tracejit::DType::F32)?;
    let out = compiled.call_arrays(&[a, b])?;
    ensure!(out[0].shape() == [2, 2, 4]);
    ensure!(out[0].to_vec_f32()? == vec![3.0; 16]);

    let a = Array::ones(&[3, 2, 3], tracejit::DType::F32)?;
    let b = Array::ones(&[2, 3, 4], tracejit::DType::F32)?;
    let err = compiled.call_arrays(&[a, b]).err();
    ensure!(matches!(
        err.as_ref().and_then(|e| e.downcast_ref::<CompileError>()),
        Some(CompileError::Shape { .. })
    ));
    Ok(())
}
