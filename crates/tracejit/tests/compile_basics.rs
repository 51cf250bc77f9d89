use anyhow::{ensure, Result};
use tracejit::{args, compile_default, Args, Array, DType, Function, Tree};

fn setup() {
    tracejit_backend_ref_cpu::register_cpu_backend();
}

#[test]
fn each_signature_gets_its_own_graph() -> Result<()> {
    setup();
    let add = Function::binary(|x, y| x.add(y));
    let compiled = compile_default(&add);

    let out = compiled.call(args![Array::scalar_f32(1.0)?, Array::scalar_f32(1.0)?])?;
    ensure!(out.array()?.item_f32()? == 2.0);

    let out = compiled.call(args![
        Array::from_f32(&[1.0, 2.0], &[2])?,
        Array::scalar_f32(1.0)?
    ])?;
    ensure!(out.array()?.to_vec_f32()? == vec![2.0, 3.0]);

    let out = compiled.call(args![
        Array::from_i32(&[1, 2], &[2])?,
        Array::from_i32(&[1, 2], &[2])?
    ])?;
    let sum = out.array()?;
    ensure!(sum.dtype() == DType::Si32);
    ensure!(sum.to_vec_i32()? == vec![2, 4]);
    ensure!(compiled.stats().traces == 3);

    // Repeats reuse the graphs traced above.
    let out = compiled.call(args![Array::scalar_f32(4.0)?, Array::scalar_f32(0.5)?])?;
    ensure!(out.array()?.item_f32()? == 4.5);
    let out = compiled.call(args![
        Array::from_i32(&[7, 8], &[2])?,
        Array::from_i32(&[1, 1], &[2])?
    ])?;
    ensure!(out.array()?.to_vec_i32()? == vec![8, 9]);

    let stats = compiled.stats();
    ensure!(stats.traces == 3, "unexpected retrace: {stats:?}");
    ensure!(stats.entries == 3);
    ensure!(stats.hits == 2);
    Ok(())
}

#[test]
fn compiled_results_match_direct_calls_bit_for_bit() -> Result<()> {
    setup();
    let f = Function::binary(|x, y| {
        let z = x.mul(y)?.exp()?.add_scalar(1.0)?;
        z.div(&x.abs()?.add_scalar(0.25)?)?.tanh()
    });
    let x = Array::from_f32(&[0.1, -0.7, 1.3, 2.9, -3.3, 0.0], &[2, 3])?;
    let y = Array::from_f32(&[0.5, 0.25, -1.5], &[3])?;

    let direct = f.call_arrays(&[x.clone(), y.clone()])?;
    let first = compile_default(&f).call_arrays(&[x.clone(), y.clone()])?;
    let second = compile_default(&f).call_arrays(&[x, y])?;
    ensure!(direct[0].array_equal(&first[0])?);
    ensure!(direct[0].array_equal(&second[0])?);
    Ok(())
}

#[test]
fn new_shape_or_dtype_retraces() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.mul(x)?.sum(&[], false));
    let compiled = compile_default(&f);

    compiled.call_arrays(&[Array::from_f32(&[1.0, 2.0], &[2])?])?;
    compiled.call_arrays(&[Array::from_f32(&[3.0, 4.0], &[2])?])?;
    ensure!(compiled.stats().traces == 1);

    let out = compiled.call_arrays(&[Array::from_f32(&[1.0, 2.0, 3.0], &[3])?])?;
    ensure!(out[0].item_f32()? == 14.0);
    let out = compiled.call_arrays(&[Array::from_i32(&[1, 2], &[2])?])?;
    ensure!(out[0].item_i32()? == 5);
    ensure!(compiled.stats().traces == 3);
    Ok(())
}

#[test]
fn structured_outputs_keep_their_shape_and_constants() -> Result<()> {
    setup();
    let f = Function::new(|args: &Args| {
        let x = args.array(0)?;
        Ok(Tree::dict([
            ("double", Tree::from(x.mul_scalar(2.0)?)),
            ("label", Tree::from("scaled")),
            ("parts", Tree::tuple([Tree::from(x.neg()?), Tree::from(3i64)])),
        ]))
    });
    let compiled = compile_default(&f);
    for _ in 0..2 {
        let out = compiled.call(args![Array::from_f32(&[1.0, -2.0], &[2])?])?;
        ensure!(out.get("double")?.array()?.to_vec_f32()? == vec![2.0, -4.0]);
        ensure!(out.get("label")?.as_str() == Some("scaled"));
        let parts = out.get("parts")?;
        ensure!(parts.index(0)?.array()?.to_vec_f32()? == vec![-1.0, 2.0]);
        ensure!(parts.index(1)?.as_f64() == Some(3.0));
    }
    ensure!(compiled.stats().traces == 1);
    Ok(())
}

#[test]
fn returning_an_input_hands_back_the_same_array() -> Result<()> {
    setup();
    let f = Function::binary(|x, _y| Ok(x.clone()));
    let compiled = compile_default(&f);
    let x = Array::from_f32(&[1.0, 2.0], &[2])?;
    let y = Array::from_f32(&[5.0], &[1])?;
    let out = compiled.call_arrays(&[x.clone(), y])?;
    ensure!(out[0].same(&x));
    Ok(())
}

#[test]
fn keyword_arguments_are_part_of_the_key() -> Result<()> {
    setup();
    let f = Function::new(|args: &Args| {
        let x = args.array(0)?;
        let scale = args.get("scale")?.as_f64().unwrap_or(1.0);
        Ok(Tree::from(x.mul_scalar(scale)?))
    });
    let compiled = compile_default(&f);
    let x = Array::from_f32(&[1.0, 2.0], &[2])?;

    let out = compiled.call(args![&x].kwarg("scale", 2.0))?;
    ensure!(out.array()?.to_vec_f32()? == vec![2.0, 4.0]);
    let out = compiled.call(args![&x].kwarg("scale", 3.0))?;
    ensure!(out.array()?.to_vec_f32()? == vec![3.0, 6.0]);
    let out = compiled.call(args![&x].kwarg("scale", 2.0))?;
    ensure!(out.array()?.to_vec_f32()? == vec![2.0, 4.0]);
    ensure!(compiled.stats().traces == 2);
    Ok(())
}

#[test]
fn compiled_functions_compose() -> Result<()> {
    setup();
    let inner = compile_default(&Function::unary(|x| x.exp()?.add_scalar(1.0)));
    let inner_fn = inner.as_function();
    let outer = compile_default(&Function::unary(move |x| {
        let y = inner_fn.call_arrays(&[x.clone()])?;
        y[0].mul(x)
    }));

    let x = Array::from_f32(&[0.0, 1.0], &[2])?;
    let expected = x.exp()?.add_scalar(1.0)?.mul(&x)?;
    let out = outer.call_arrays(&[x])?;
    ensure!(out[0].allclose(&expected, 1e-6, 1e-6)?);
    Ok(())
}

#[test]
fn wrappers_of_one_function_share_a_cache() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.sqrt());
    let a = compile_default(&f);
    let b = compile_default(&f);
    a.call_arrays(&[Array::from_f32(&[4.0], &[1])?])?;
    let out = b.call_arrays(&[Array::from_f32(&[9.0], &[1])?])?;
    ensure!(out[0].to_vec_f32()? == vec![3.0]);
    ensure!(a.stats().traces == 1 && b.stats().hits == 1);
    Ok(())
}
