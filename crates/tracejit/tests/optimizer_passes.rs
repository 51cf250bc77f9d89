use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use tracejit::compile::CompiledGraph;
use tracejit::{
    args, compile, compile_default, Args, Array, CompileOptions, DType, Function, Tree,
};

fn setup() {
    tracejit_backend_ref_cpu::register_cpu_backend();
}

fn traced(compiled: &tracejit::Compiled, x: &Array) -> Result<Arc<CompiledGraph>> {
    compiled.call(args![x])?;
    compiled
        .cached_graph(&args![x])?
        .ok_or_else(|| anyhow!("graph was not cached"))
}

#[test]
fn duplicate_subexpressions_are_computed_once() -> Result<()> {
    setup();
    let f = Function::unary(|x| {
        let a = x.exp()?.sum(&[0], false)?;
        let b = x.exp()?.sum(&[0], false)?;
        a.add(&b)
    });
    let compiled = compile_default(&f);
    let x = Array::from_f32(&[0.0, 1.0, 2.0, 0.0, 1.0, 2.0], &[2, 3])?;
    let graph = traced(&compiled, &x)?;
    ensure!(graph.count_label("Sum") == 1, "{graph}");

    let expected = f.call_arrays(&[x.clone()])?;
    ensure!(compiled.call_arrays(&[x])?[0].array_equal(&expected[0])?);
    Ok(())
}

#[test]
fn unused_work_is_dropped() -> Result<()> {
    setup();
    let f = Function::unary(|x| {
        let _unused = x.matmul(&x.t()?)?;
        x.neg()
    });
    let graph = traced(&compile_default(&f), &Array::ones(&[2, 2], DType::F32)?)?;
    ensure!(graph.count_label("Matmul") == 0, "{graph}");
    ensure!(graph.nodes.len() == 1);
    Ok(())
}

#[test]
fn identity_broadcasts_are_removed_from_static_graphs() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.broadcast_to(&[3])?.reshape(&[3])?.sum(&[], false));
    let graph = traced(&compile_default(&f), &Array::ones(&[3], DType::F32)?)?;
    ensure!(graph.count_label("Broadcast") == 0, "{graph}");
    ensure!(graph.count_label("Reshape") == 0, "{graph}");

    let shapeless = compile(&f, CompileOptions::shapeless());
    let graph = traced(&shapeless, &Array::ones(&[3], DType::F32)?)?;
    ensure!(graph.count_label("Broadcast") == 1, "{graph}");
    Ok(())
}

#[test]
fn elementwise_chains_fuse_and_match_unfused_results() -> Result<()> {
    setup();
    let f = Function::unary(|x| {
        let y = x.mul(x)?.add_scalar(1.0)?.sqrt()?;
        let mask = x.greater(&Array::scalar_f32(0.0)?)?;
        Array::select(&mask, &y, &y.neg()?)
    });
    let compiled = compile_default(&f);
    let x = Array::from_f32(&[-2.0, -0.5, 0.0, 0.5, 2.0], &[5])?;
    let graph = traced(&compiled, &x)?;

    let fused: Vec<String> = graph
        .nodes
        .iter()
        .map(|node| node.op.label().into_owned())
        .filter(|label| label.starts_with("Compiled"))
        .collect();
    ensure!(fused.len() == 1, "{graph}");
    ensure!(fused[0].ends_with("Select"), "{}", fused[0]);

    let expected = f.call_arrays(&[x.clone()])?;
    ensure!(compiled.call_arrays(&[x])?[0].array_equal(&expected[0])?);
    Ok(())
}

#[test]
fn broadcast_shared_with_a_reduction_keeps_its_producer() -> Result<()> {
    setup();
    let f = Function::new(|args: &Args| {
        let (x, b, z) = (args.array(0)?, args.array(1)?, args.array(2)?);
        let spread = b.exp()?.broadcast_to(&[3, 3])?;
        let combined = x.add(&spread.mul(z)?)?;
        Ok(Tree::tuple([
            Tree::from(combined),
            Tree::from(spread.sum(&[], false)?),
        ]))
    });
    let compiled = compile_default(&f);
    let x = Array::ones(&[3, 3], DType::F32)?;
    let b = Array::zeros(&[3], DType::F32)?;
    let z = Array::ones(&[3, 3], DType::F32)?;

    let expected = f.call(&args![&x, &b, &z])?.arrays();
    for _ in 0..2 {
        let out = compiled.call(args![&x, &b, &z])?.arrays();
        ensure!(out[0].to_vec_f32()? == vec![2.0; 9]);
        ensure!(out[0].array_equal(&expected[0])?);
        ensure!(out[1].item_f32()? == 9.0);
    }
    ensure!(compiled.stats().traces == 1);
    Ok(())
}

#[test]
fn graph_text_lists_dynamic_dims_for_shapeless_graphs() -> Result<()> {
    setup();
    let f = Function::unary(|x| x.exp());
    let graph = traced(
        &compile(&f, CompileOptions::shapeless()),
        &Array::ones(&[2, 3], DType::F32)?,
    )?;
    let text = graph.to_string();
    ensure!(text.starts_with("func @"), "{text}");
    ensure!(text.contains('?'), "{text}");
    ensure!(graph.dynamic_dims.len() == 2);
    Ok(())
}
