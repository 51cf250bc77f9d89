use anyhow::{ensure, Result};
use smallvec::smallvec;
use tracejit::backend::fusion::{FusedNode, FusedOp, FusedSpec, FusionRef};
use tracejit::backend::registry;
use tracejit::backend::spec::{
    DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, PortableBackend, StackSpec,
    TensorLiteral, TensorSpec,
};
use tracejit_backend_ref_cpu::{register_cpu_backend, CpuPortableBackend};

#[test]
fn backend_is_registered_as_cpu() -> Result<()> {
    register_cpu_backend();
    ensure!(registry::list_backends().iter().any(|name| name == "cpu"));
    ensure!(registry::default_backend()?.backend_name() == "cpu");
    Ok(())
}

#[test]
fn fused_units_match_their_unfused_ops() -> Result<()> {
    let backend = CpuPortableBackend::new();
    let x = TensorLiteral::from_f32(&[3], &[0.5, -1.0, 2.0])?;
    let y = TensorLiteral::from_f32(&[], &[3.0])?;
    let spec = TensorSpec::concrete(DType::F32, &[3]);

    // exp(x) * y + x
    let fused = FusedSpec::new(vec![
        FusedNode {
            op: FusedOp::Unary(ElementwiseUnaryOp::Exp),
            args: smallvec![FusionRef::Input(0)],
        },
        FusedNode {
            op: FusedOp::Binary(ElementwiseBinaryOp::Mul),
            args: smallvec![FusionRef::Node(0), FusionRef::Input(1)],
        },
        FusedNode {
            op: FusedOp::Binary(ElementwiseBinaryOp::Add),
            args: smallvec![FusionRef::Node(1), FusionRef::Input(0)],
        },
    ]);
    let out = backend.execute(&Operation::Fused(fused), &[x.clone(), y.clone()], &spec)?;

    let e = backend.execute(
        &Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
        &[x.clone()],
        &spec,
    )?;
    let m = backend.execute(
        &Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
        &[e, y],
        &spec,
    )?;
    let expected = backend.execute(
        &Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
        &[m, x],
        &spec,
    )?;
    ensure!(out.bytes == expected.bytes);
    Ok(())
}

#[test]
fn fused_output_spec_mismatch_is_reported() -> Result<()> {
    let backend = CpuPortableBackend::new();
    let x = TensorLiteral::from_f32(&[2], &[1.0, 2.0])?;
    let fused = FusedSpec::new(vec![
        FusedNode {
            op: FusedOp::Unary(ElementwiseUnaryOp::Neg),
            args: smallvec![FusionRef::Input(0)],
        },
        FusedNode {
            op: FusedOp::Unary(ElementwiseUnaryOp::Abs),
            args: smallvec![FusionRef::Node(0)],
        },
    ]);
    let wrong = TensorSpec::concrete(DType::F32, &[3]);
    ensure!(backend
        .execute(&Operation::Fused(fused), &[x], &wrong)
        .is_err());
    Ok(())
}

#[test]
fn stack_interleaves_along_inner_axis() -> Result<()> {
    let backend = CpuPortableBackend::new();
    let a = TensorLiteral::from_i32(&[2], &[1, 2])?;
    let b = TensorLiteral::from_i32(&[2], &[3, 4])?;
    let out = backend.execute(
        &Operation::Stack(StackSpec { axis: 1 }),
        &[a, b],
        &TensorSpec::concrete(DType::Si32, &[2, 2]),
    )?;
    ensure!(out.to_i32_vec() == vec![1, 3, 2, 4]);
    Ok(())
}

#[test]
fn integer_division_floors_and_nan_propagates_through_max() -> Result<()> {
    let backend = CpuPortableBackend::new();
    let spec = TensorSpec::concrete(DType::Si32, &[2]);
    let a = TensorLiteral::from_i32(&[2], &[7, -7])?;
    let b = TensorLiteral::from_i32(&[2], &[2, 2])?;
    let out = backend.execute(
        &Operation::ElementwiseBinary(ElementwiseBinaryOp::Div),
        &[a, b],
        &spec,
    )?;
    ensure!(out.to_i32_vec() == vec![3, -4]);

    let fspec = TensorSpec::concrete(DType::F32, &[2]);
    let x = TensorLiteral::from_f32(&[2], &[f32::NAN, 1.0])?;
    let y = TensorLiteral::from_f32(&[2], &[0.0, 2.0])?;
    let out = backend.execute(
        &Operation::ElementwiseBinary(ElementwiseBinaryOp::Maximum),
        &[x, y],
        &fspec,
    )?;
    let values = out.to_f32_vec();
    ensure!(values[0].is_nan() && values[1] == 2.0);
    Ok(())
}
