//! Graphviz rendering of the lazy node graph behind a set of arrays.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use anyhow::Result;

use crate::backend::spec::DType;
use crate::tensor::{Array, ArrayId};

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f32",
        DType::Si32 => "i32",
        DType::I1 => "bool",
    }
}

/// Every array reachable from `roots`, inputs before users.
fn postorder(roots: &[&Array]) -> Vec<Array> {
    let mut order = Vec::new();
    let mut visited: HashSet<ArrayId> = HashSet::new();
    let mut stack: Vec<(Array, bool)> = roots.iter().rev().map(|a| ((*a).clone(), false)).collect();
    while let Some((array, expanded)) = stack.pop() {
        if expanded {
            order.push(array);
            continue;
        }
        if !visited.insert(array.id()) {
            continue;
        }
        let children: Vec<Array> = array
            .inputs()
            .iter()
            .rev()
            .filter(|input| !visited.contains(&input.id()))
            .cloned()
            .collect();
        stack.push((array, true));
        stack.extend(children.into_iter().map(|child| (child, false)));
    }
    order
}

/// Writes a `digraph` with one rectangle per operation and one ellipse per
/// leaf array. `named` pairs a display name with each root; an empty name
/// leaves the root unnamed. Named leaves show their name, named operation
/// results get an extra node carrying the name.
///
/// Operations appear under their label, so fused units show up as
/// `Compiled...` nodes.
pub fn export_to_dot<W: Write>(out: &mut W, named: &[(&str, &Array)]) -> Result<()> {
    let mut names: HashMap<ArrayId, Vec<&str>> = HashMap::new();
    for (name, array) in named {
        if !name.is_empty() {
            names.entry(array.id()).or_default().push(name);
        }
    }
    let roots: Vec<&Array> = named.iter().map(|(_, array)| *array).collect();
    let order = postorder(&roots);

    writeln!(out, "digraph {{")?;
    for array in &order {
        let id = array.id().raw();
        match array.op() {
            Some(op) => {
                writeln!(out, "  n{id} [label=\"{}\", shape=rectangle];", escape(&op.label()))?;
                for input in array.inputs() {
                    writeln!(out, "  n{} -> n{id};", input.id().raw())?;
                }
                if let Some(list) = names.get(&array.id()) {
                    for (idx, name) in list.iter().enumerate() {
                        writeln!(out, "  name{id}_{idx} [label=\"{}\"];", escape(name))?;
                        writeln!(out, "  n{id} -> name{id}_{idx};")?;
                    }
                }
            }
            None => {
                let label = match names.get(&array.id()) {
                    Some(list) => list.join(", "),
                    None => format!("{} {:?}", dtype_name(array.dtype()), array.shape()),
                };
                writeln!(out, "  n{id} [label=\"{}\"];", escape(&label))?;
            }
        }
    }
    writeln!(out, "}}")?;
    log::debug!("exported {} array(s) to dot", order.len());
    Ok(())
}

/// [`export_to_dot`] for unnamed roots.
pub fn export_arrays_to_dot<W: Write>(out: &mut W, arrays: &[Array]) -> Result<()> {
    let named: Vec<(&str, &Array)> = arrays.iter().map(|array| ("", array)).collect();
    export_to_dot(out, &named)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_use_names_and_ops_use_labels() -> Result<()> {
        let a = Array::from_f32(&[1.0, 2.0], &[2])?;
        let b = Array::from_f32(&[3.0, 4.0], &[2])?;
        let c = a.add(&b)?;
        let mut buf = Vec::new();
        export_to_dot(&mut buf, &[("a", &a), ("b", &b), ("c", &c)])?;
        let text = String::from_utf8(buf)?;
        assert!(text.starts_with("digraph {"));
        assert!(text.contains(&format!("n{} [label=\"a\"];", a.id().raw())));
        assert!(text.contains(&format!("n{} [label=\"Add\", shape=rectangle];", c.id().raw())));
        assert!(text.contains(&format!("n{} -> n{};", b.id().raw(), c.id().raw())));
        assert!(text.contains("[label=\"c\"]"));
        Ok(())
    }

    #[test]
    fn shared_inputs_are_emitted_once() -> Result<()> {
        let x = Array::from_f32(&[1.0], &[1])?;
        let y = x.mul(&x)?.exp()?;
        let mut buf = Vec::new();
        export_arrays_to_dot(&mut buf, &[y])?;
        let text = String::from_utf8(buf)?;
        assert_eq!(text.matches(&format!("n{} [label=", x.id().raw())).count(), 1);
        assert_eq!(text.matches("f32 [1]").count(), 1);
        Ok(())
    }
}
