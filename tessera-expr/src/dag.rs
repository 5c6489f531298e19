//! Arena-backed expression DAGs.
//!
//! Nodes live in a dense vector and reference each other by index; a node's
//! children always precede it, so construction order is a valid evaluation
//! order. Composing two expressions clones both inputs into the new arena,
//! leaving the inputs intact and reusable.

use std::fmt::{Display, Formatter};

use tessera_dtype::CoordType;
use tessera_error::{tessera_bail, tessera_err, TesseraResult};

use crate::value::{apply, ExprValue};
use crate::Operator;

type NodeId = usize;
type VarId = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Node {
    Const(ExprValue),
    Var(VarId),
    Op {
        op: Operator,
        lhs: NodeId,
        rhs: NodeId,
        /// Coerced result of the last evaluation of this operator.
        cached: Option<ExprValue>,
    },
}

/// A typed arithmetic expression over named variables.
///
/// Build leaves with [`Expr::constant`] and [`Expr::var`], compose with
/// [`Expr::binary`], then [`Expr::eval`] against values indexed by variable
/// id. Variable ids are dense and follow insertion order; composition
/// merges the operands' variable tables, keeping the left side's ids and
/// appending the right side's unseen variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    /// Variable id -> name, in insertion order.
    vars: Vec<String>,
    result: Option<ExprValue>,
}

impl Expr {
    /// A one-node expression holding a constant. Already evaluated.
    pub fn constant(value: impl Into<ExprValue>) -> Self {
        let value = value.into();
        Self {
            nodes: vec![Node::Const(value)],
            root: Some(0),
            vars: Vec::new(),
            result: Some(value),
        }
    }

    /// A one-variable expression. Unevaluated until bound.
    pub fn var(name: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node::Var(0)],
            root: Some(0),
            vars: vec![name.into()],
            result: None,
        }
    }

    /// `a op b` as a new expression. Both inputs are cloned; they stay
    /// valid and independent of the result.
    pub fn binary(a: &Expr, b: &Expr, op: Operator) -> TesseraResult<Expr> {
        let a_root = a.require_root()?;
        let b_root = b.require_root()?;

        let mut nodes = a.nodes.clone();
        let mut vars = a.vars.clone();

        // Splice b's arena in, remapping node ids by offset and variable
        // ids through the merged table.
        let offset = nodes.len();
        let var_map: Vec<VarId> = b
            .vars
            .iter()
            .map(|name| match vars.iter().position(|v| v == name) {
                Some(id) => id,
                None => {
                    vars.push(name.clone());
                    vars.len() - 1
                }
            })
            .collect();
        for node in &b.nodes {
            nodes.push(match *node {
                Node::Const(v) => Node::Const(v),
                Node::Var(vid) => Node::Var(var_map[vid]),
                Node::Op { op, lhs, rhs, .. } => Node::Op {
                    op,
                    lhs: lhs + offset,
                    rhs: rhs + offset,
                    cached: None,
                },
            });
        }

        nodes.push(Node::Op {
            op,
            lhs: a_root,
            rhs: b_root + offset,
            cached: None,
        });
        Ok(Expr {
            root: Some(nodes.len() - 1),
            nodes,
            vars,
            result: None,
        })
    }

    pub fn var_num(&self) -> usize {
        self.vars.len()
    }

    pub fn var_names(&self) -> &[String] {
        &self.vars
    }

    /// The dense id of each named variable, `None` for unknown names.
    pub fn var_ids(&self, names: &[&str]) -> Vec<Option<VarId>> {
        names
            .iter()
            .map(|name| self.vars.iter().position(|v| v == name))
            .collect()
    }

    /// Evaluate against `values`, indexed by variable id.
    ///
    /// Every variable must be bound. The result is retrieved with
    /// [`Expr::value`] / [`Expr::result_type`]; operator nodes keep their
    /// coerced result cached for inspection by later evaluations.
    pub fn eval(&mut self, values: &[ExprValue]) -> TesseraResult<()> {
        let root = self.require_root()?;
        if values.len() != self.vars.len() {
            tessera_bail!(
                "expression binds {} variables, got {} values",
                self.vars.len(),
                values.len()
            );
        }

        // Mark unevaluated until the traversal completes.
        self.result = None;

        let mut computed: Vec<Option<ExprValue>> = vec![None; self.nodes.len()];
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            let node = self.nodes[id];
            match node {
                Node::Const(v) => computed[id] = Some(v),
                Node::Var(vid) => computed[id] = Some(values[vid]),
                Node::Op { op, lhs, rhs, .. } => {
                    if !expanded {
                        stack.push((id, true));
                        stack.push((rhs, false));
                        stack.push((lhs, false));
                    } else {
                        let value = apply(
                            op,
                            take_computed(&computed, lhs),
                            take_computed(&computed, rhs),
                        )?;
                        computed[id] = Some(value);
                        self.nodes[id] = Node::Op {
                            op,
                            lhs,
                            rhs,
                            cached: Some(value),
                        };
                    }
                }
            }
        }

        self.result = Some(take_computed(&computed, root));
        Ok(())
    }

    /// The value of the expression.
    ///
    /// Errors with `NotEvaluated` unless the expression is a constant or a
    /// successful [`Expr::eval`] has run since the last structural change.
    pub fn value(&self) -> TesseraResult<ExprValue> {
        match self.result {
            Some(v) => Ok(v),
            None => Err(tessera_err!(NotEvaluated: "call eval() first")),
        }
    }

    /// The type of the evaluated result, if any.
    pub fn result_type(&self) -> Option<CoordType> {
        self.result.map(|v| v.value_type())
    }

    /// Partially evaluate: bind the named variables, fold every operator
    /// whose operands become constant, and drop the bound variables from
    /// the table. Unbound variables survive and are renumbered densely in
    /// insertion order.
    pub fn purge(&mut self, names: &[&str], values: &[ExprValue]) -> TesseraResult<()> {
        let root = self.require_root()?;
        if names.len() != values.len() {
            tessera_bail!("{} names but {} values", names.len(), values.len());
        }
        let mut bindings: Vec<Option<ExprValue>> = vec![None; self.vars.len()];
        for (name, value) in names.iter().zip(values) {
            match self.vars.iter().position(|v| v == name) {
                Some(id) => bindings[id] = Some(*value),
                None => tessera_bail!("unknown variable {}", name),
            }
        }

        // Fold pass: a node's children precede it in the arena, so one
        // forward sweep sees constants before their parents. An operator
        // that cannot evaluate (unbound input, or an op/type mismatch such
        // as % on floats) simply stays unfolded.
        let mut folded: Vec<Option<ExprValue>> = vec![None; self.nodes.len()];
        for id in 0..self.nodes.len() {
            folded[id] = match self.nodes[id] {
                Node::Const(v) => Some(v),
                Node::Var(vid) => bindings[vid],
                Node::Op { op, lhs, rhs, .. } => match (folded[lhs], folded[rhs]) {
                    (Some(a), Some(b)) => apply(op, a, b).ok(),
                    _ => None,
                },
            };
        }

        // Rebuild the arena from the root, compacting away folded subtrees
        // and orphaned nodes.
        let mut rebuilt = Expr {
            nodes: Vec::new(),
            root: None,
            vars: Vec::new(),
            result: None,
        };
        let mut var_map: Vec<Option<VarId>> = vec![None; self.vars.len()];
        let new_root = self.rebuild(root, &folded, &mut rebuilt, &mut var_map);
        rebuilt.root = Some(new_root);
        if let Node::Const(v) = rebuilt.nodes[new_root] {
            rebuilt.result = Some(v);
        }
        *self = rebuilt;
        Ok(())
    }

    fn rebuild(
        &self,
        id: NodeId,
        folded: &[Option<ExprValue>],
        out: &mut Expr,
        var_map: &mut [Option<VarId>],
    ) -> NodeId {
        if let Some(v) = folded[id] {
            out.nodes.push(Node::Const(v));
            return out.nodes.len() - 1;
        }
        match self.nodes[id] {
            Node::Const(_) => unreachable!("constants always fold"),
            Node::Var(vid) => {
                let new_vid = match var_map[vid] {
                    Some(v) => v,
                    None => {
                        out.vars.push(self.vars[vid].clone());
                        let v = out.vars.len() - 1;
                        var_map[vid] = Some(v);
                        v
                    }
                };
                out.nodes.push(Node::Var(new_vid));
                out.nodes.len() - 1
            }
            Node::Op { op, lhs, rhs, .. } => {
                let new_lhs = self.rebuild(lhs, folded, out, var_map);
                let new_rhs = self.rebuild(rhs, folded, out, var_map);
                out.nodes.push(Node::Op {
                    op,
                    lhs: new_lhs,
                    rhs: new_rhs,
                    cached: None,
                });
                out.nodes.len() - 1
            }
        }
    }

    fn require_root(&self) -> TesseraResult<NodeId> {
        match self.root {
            Some(root) => Ok(root),
            None => Err(tessera_err!("expression has no root")),
        }
    }
}

fn take_computed(computed: &[Option<ExprValue>], id: NodeId) -> ExprValue {
    match computed[id] {
        Some(v) => v,
        None => unreachable!("postorder visits children first"),
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn write_node(expr: &Expr, id: NodeId, f: &mut Formatter<'_>) -> std::fmt::Result {
            match expr.nodes[id] {
                Node::Const(v) => write!(f, "{v}"),
                Node::Var(vid) => write!(f, "{}", expr.vars[vid]),
                Node::Op { op, lhs, rhs, .. } => {
                    write!(f, "(")?;
                    write_node(expr, lhs, f)?;
                    write!(f, " {op} ")?;
                    write_node(expr, rhs, f)?;
                    write!(f, ")")
                }
            }
        }
        match self.root {
            Some(root) => write_node(self, root, f),
            None => write!(f, "<empty>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_error::TesseraError;

    use super::*;

    fn a_times_5_plus_b() -> Expr {
        let a = Expr::var("a");
        let five = Expr::constant(5i32);
        let b = Expr::var("b");
        let mul = Expr::binary(&a, &five, Operator::Mul).unwrap();
        Expr::binary(&mul, &b, Operator::Add).unwrap()
    }

    #[test]
    fn constant_is_already_evaluated() {
        let e = Expr::constant(42i64);
        assert_eq!(e.value().unwrap(), ExprValue::I64(42));
        assert_eq!(e.result_type(), Some(CoordType::I64));
    }

    #[test]
    fn lone_var_copies_its_binding() {
        let mut e = Expr::var("x");
        assert!(matches!(e.value(), Err(TesseraError::NotEvaluated(_))));
        e.eval(&[ExprValue::F32(1.5)]).unwrap();
        assert_eq!(e.value().unwrap(), ExprValue::F32(1.5));
    }

    #[test]
    fn eval_coerces_to_the_widest_operand() {
        let mut e = a_times_5_plus_b();
        assert_eq!(e.var_names(), &["a".to_string(), "b".to_string()]);
        e.eval(&[ExprValue::I32(3), ExprValue::F64(5.1)]).unwrap();
        assert_eq!(e.result_type(), Some(CoordType::F64));
        let got = e.value().unwrap().as_f64().unwrap();
        assert!((got - 20.1).abs() <= f64::EPSILON * 32.0);
    }

    #[test]
    fn inputs_stay_usable_after_composition() {
        let a = Expr::var("a");
        let sum = Expr::binary(&a, &a, Operator::Add).unwrap();
        // One shared variable, not two.
        assert_eq!(sum.var_num(), 1);
        let mut product = Expr::binary(&sum, &a, Operator::Mul).unwrap();
        product.eval(&[ExprValue::I32(4)]).unwrap();
        assert_eq!(product.value().unwrap(), ExprValue::I32(32));
    }

    #[test]
    fn rem_on_floats_errors() {
        let x = Expr::var("x");
        let two = Expr::constant(2.0f64);
        let mut e = Expr::binary(&x, &two, Operator::Rem).unwrap();
        let err = e.eval(&[ExprValue::I32(5)]).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidOperator(_)));
        assert!(matches!(e.value(), Err(TesseraError::NotEvaluated(_))));
    }

    #[test]
    fn purge_folds_bound_subtrees() {
        let mut e = a_times_5_plus_b();
        e.purge(&["a"], &[ExprValue::I32(3)]).unwrap();
        // a*5 collapsed to a constant; only b remains, renumbered to id 0.
        assert_eq!(e.var_names(), &["b".to_string()]);
        assert_eq!(e.var_ids(&["b", "a"]), vec![Some(0), None]);
        e.eval(&[ExprValue::F64(5.1)]).unwrap();
        let got = e.value().unwrap().as_f64().unwrap();
        assert!((got - 20.1).abs() <= f64::EPSILON * 32.0);
    }

    #[test]
    fn purge_of_every_variable_materializes_the_value() {
        let mut e = a_times_5_plus_b();
        e.purge(&["a", "b"], &[ExprValue::I32(3), ExprValue::I32(7)])
            .unwrap();
        assert_eq!(e.var_num(), 0);
        assert_eq!(e.value().unwrap(), ExprValue::I32(22));
    }

    #[test]
    fn purge_then_eval_matches_full_eval() {
        // eval(purge(e, {a}), {b, c}) == eval(e, {a, b, c})
        let a = Expr::var("a");
        let b = Expr::var("b");
        let c = Expr::var("c");
        let ab = Expr::binary(&a, &b, Operator::Mul).unwrap();
        let e = Expr::binary(&ab, &c, Operator::Sub).unwrap();

        let mut full = e.clone();
        full.eval(&[
            ExprValue::I64(6),
            ExprValue::I64(7),
            ExprValue::F64(0.5),
        ])
        .unwrap();

        let mut partial = e.clone();
        partial.purge(&["a"], &[ExprValue::I64(6)]).unwrap();
        assert_eq!(partial.var_names(), &["b".to_string(), "c".to_string()]);
        partial
            .eval(&[ExprValue::I64(7), ExprValue::F64(0.5)])
            .unwrap();

        assert_eq!(full.value().unwrap(), partial.value().unwrap());
    }

    #[test]
    fn purge_keeps_unfoldable_operators() {
        // x % 2.0 cannot fold, with or without x bound.
        let x = Expr::var("x");
        let two = Expr::constant(2.0f64);
        let mut e = Expr::binary(&x, &two, Operator::Rem).unwrap();
        e.purge(&["x"], &[ExprValue::I32(5)]).unwrap();
        assert!(matches!(e.value(), Err(TesseraError::NotEvaluated(_))));
    }

    #[test]
    fn purge_rejects_unknown_variables() {
        let mut e = a_times_5_plus_b();
        assert!(e.purge(&["z"], &[ExprValue::I32(1)]).is_err());
    }

    #[test]
    fn eval_requires_every_binding() {
        let mut e = a_times_5_plus_b();
        assert!(e.eval(&[ExprValue::I32(3)]).is_err());
    }
}
