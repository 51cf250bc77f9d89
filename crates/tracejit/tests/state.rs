use anyhow::{ensure, Result};
use tracejit::{
    args, compile, Args, Array, CompileError, CompileOptions, DType, Function, State, Tree,
};

fn setup() {
    tracejit_backend_ref_cpu::register_cpu_backend();
}

/// `acc += x; return acc * 2`
fn accumulate(state: &State) -> Function {
    let state = state.clone();
    Function::new(move |args: &Args| {
        let x = args.array(0)?;
        let acc = state.array("acc")?.add(x)?;
        state.set("acc", acc.clone())?;
        Ok(Tree::from(acc.mul_scalar(2.0)?))
    })
}

#[test]
fn state_updates_carry_over_between_calls() -> Result<()> {
    setup();
    let state = State::map();
    state.set("acc", Array::zeros(&[2], DType::F32)?)?;
    let options = CompileOptions::default().with_state(state.clone());
    let compiled = compile(&accumulate(&state), options);

    let reference = State::map();
    reference.set("acc", Array::zeros(&[2], DType::F32)?)?;
    let uncompiled = accumulate(&reference);

    let x = Array::from_f32(&[1.0, 2.0], &[2])?;
    for _ in 0..3 {
        let out = compiled.call(args![&x])?;
        let expected = uncompiled.call(&args![&x])?;
        ensure!(out.array()?.array_equal(expected.array()?)?);
        ensure!(state.array("acc")?.array_equal(&reference.array("acc")?)?);
    }
    ensure!(state.array("acc")?.to_vec_f32()? == vec![3.0, 6.0]);
    Ok(())
}

#[test]
fn inputs_only_state_is_read_but_not_written_back() -> Result<()> {
    setup();
    let state = State::map();
    state.set("w", Array::from_f32(&[2.0, 3.0], &[2])?)?;
    let reader = state.clone();
    let f = Function::unary(move |x| x.mul(&reader.array("w")?));
    let compiled = compile(&f, CompileOptions::default().with_inputs([state.clone()]));

    let x = Array::from_f32(&[1.0, 1.0], &[2])?;
    ensure!(compiled.call_arrays(&[x.clone()])?[0].to_vec_f32()? == vec![2.0, 3.0]);

    // Replacing the leaf changes the key, so the new value is seen.
    state.set("w", Array::from_f32(&[5.0, 7.0], &[2])?)?;
    ensure!(compiled.call_arrays(&[x.clone()])?[0].to_vec_f32()? == vec![5.0, 7.0]);
    ensure!(compiled.stats().traces == 2);
    ensure!(state.array("w")?.to_vec_f32()? == vec![5.0, 7.0]);
    Ok(())
}

#[test]
fn traced_state_is_restored_after_the_trace() -> Result<()> {
    setup();
    let state = State::map();
    let initial = Array::from_f32(&[1.0], &[1])?;
    state.set("acc", initial.clone())?;
    let options = CompileOptions::default().with_state(state.clone());
    let compiled = compile(&accumulate(&state), options);

    compiled.call(args![Array::from_f32(&[4.0], &[1])?])?;
    let acc = state.array("acc")?;
    // The container holds a bound result, not a trace placeholder.
    ensure!(acc.to_vec_f32()? == vec![5.0]);
    ensure!(!acc.same(&initial));
    Ok(())
}

#[test]
fn constants_written_to_state_are_replayed() -> Result<()> {
    setup();
    let state = State::map();
    state.set("steps", 0i64)?;
    let writer = state.clone();
    let f = Function::unary(move |x| {
        writer.set("steps", 1i64)?;
        writer.set("last", x.clone())?;
        x.exp()
    });
    let compiled = compile(&f, CompileOptions::default().with_outputs([state.clone()]));

    let x = Array::from_f32(&[0.0], &[1])?;
    compiled.call_arrays(&[x.clone()])?;
    ensure!(state.get("steps")?.as_f64() == Some(1.0));

    state.set("steps", 0i64)?;
    let y = Array::from_f32(&[1.0], &[1])?;
    compiled.call_arrays(&[y.clone()])?;
    ensure!(compiled.stats().traces == 1);
    ensure!(state.get("steps")?.as_f64() == Some(1.0));
    ensure!(state.array("last")?.same(&y));
    Ok(())
}

#[test]
fn list_state_round_trips_by_index() -> Result<()> {
    setup();
    let state = State::list([
        Tree::from(Array::from_f32(&[1.0], &[1])?),
        Tree::from(Array::from_f32(&[10.0], &[1])?),
    ]);
    let handle = state.clone();
    let f = Function::new(move |_args: &Args| {
        let a = handle.array_at(0)?;
        let b = handle.array_at(1)?;
        handle.set_index(0, b.clone())?;
        handle.set_index(1, a.add(&b)?)?;
        Ok(Tree::none())
    });
    let compiled = compile(&f, CompileOptions::default().with_state(state.clone()));

    for _ in 0..4 {
        compiled.call(Args::default())?;
    }
    ensure!(state.array_at(0)?.item_f32()? == 32.0);
    ensure!(state.array_at(1)?.item_f32()? == 53.0);
    Ok(())
}

#[test]
fn reading_an_argument_through_a_closure_is_unbound() -> Result<()> {
    setup();
    let x = Array::from_f32(&[1.0, 2.0], &[2])?;
    let hidden = x.clone();
    let f = Function::unary(move |arg| arg.add(&hidden));
    let compiled = compile(&f, CompileOptions::default());

    let err = compiled.call_arrays(&[x]).err();
    ensure!(matches!(
        err.as_ref().and_then(|e| e.downcast_ref::<CompileError>()),
        Some(CompileError::UnboundLeaf { .. })
    ));
    ensure!(compiled.stats().entries == 0);
    Ok(())
}
