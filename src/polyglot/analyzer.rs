//! Dependency Analyzer
//!
//! Walks a linear statement window and discovers which adjacent polyglot
//! statements may overlap. A statement qualifies when it contains exactly one
//! polyglot block in a recognized position:
//!
//! - `let x = <<...>>`   reads its bound variables, writes `x`
//! - `x = <<...>>`       reads its bound variables, writes `x`
//! - `<<...>>`           reads its bound variables, writes nothing
//!
//! Everything else is a sequential barrier, including statements whose
//! read/write sets cannot be determined exactly (the conservative default).
//! The analyzer never reorders statements; it only groups independent
//! neighbors.

use crate::ast::types::{AssignTarget, ExprKind, Stmt, StmtKind};

use super::block::PolyglotBlock;

/// How a block's result lands in the host environment.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockBinding {
    /// `let name = <<...>>`
    Declare(String),
    /// `name = <<...>>`
    Assign(String),
    /// Statement position: result discarded
    Discard,
}

/// One analyzable polyglot statement.
#[derive(Debug, Clone)]
pub struct DependencyBlock {
    /// Position in the enclosing statement window
    pub index: usize,
    pub block: PolyglotBlock,
    pub binding: BlockBinding,
}

impl DependencyBlock {
    /// Host variables the block reads; the bound-variable list is
    /// authoritative.
    pub fn read_set(&self) -> &[String] {
        &self.block.bound_variables
    }

    /// The host variable the block writes, if it is in assignment position.
    pub fn write_name(&self) -> Option<&str> {
        match &self.binding {
            BlockBinding::Declare(name) | BlockBinding::Assign(name) => Some(name),
            BlockBinding::Discard => None,
        }
    }

    /// RAW / WAW / WAR against an earlier block.
    fn depends_on(&self, earlier: &DependencyBlock) -> bool {
        let earlier_write = earlier.write_name();
        let self_write = self.write_name();
        // Read-after-write
        if let Some(w) = earlier_write {
            if self.read_set().iter().any(|r| r == w) {
                return true;
            }
        }
        // Write-after-write
        if let (Some(a), Some(b)) = (earlier_write, self_write) {
            if a == b {
                return true;
            }
        }
        // Write-after-read
        if let Some(w) = self_write {
            if earlier.read_set().iter().any(|r| r == w) {
                return true;
            }
        }
        false
    }
}

/// One unit of the execution plan, in source order.
#[derive(Debug)]
pub enum ScheduleUnit {
    /// Execute statement `index` sequentially.
    Barrier(usize),
    /// Execute these blocks concurrently, then merge in source order.
    Group(Vec<DependencyBlock>),
}

/// Partition a statement window into barriers and parallel groups.
pub fn analyze(stmts: &[Stmt]) -> Vec<ScheduleUnit> {
    let mut units = Vec::new();
    // Open groups of the current window, in order.
    let mut window: Vec<Vec<DependencyBlock>> = Vec::new();

    let flush = |window: &mut Vec<Vec<DependencyBlock>>, units: &mut Vec<ScheduleUnit>| {
        for group in window.drain(..) {
            units.push(ScheduleUnit::Group(group));
        }
    };

    for (index, stmt) in stmts.iter().enumerate() {
        match as_dependency_block(index, stmt) {
            Some(block) => {
                // The earliest group this block may join is one past the last
                // group containing a dependency.
                let mut earliest = 0;
                for (group_idx, group) in window.iter().enumerate() {
                    if group.iter().any(|member| block.depends_on(member)) {
                        earliest = group_idx + 1;
                    }
                }
                if earliest < window.len() {
                    window[earliest].push(block);
                } else {
                    window.push(vec![block]);
                }
            }
            None => {
                flush(&mut window, &mut units);
                units.push(ScheduleUnit::Barrier(index));
            }
        }
    }
    flush(&mut window, &mut units);
    units
}

/// Recognize a single-polyglot-block statement; anything else is a barrier.
fn as_dependency_block(index: usize, stmt: &Stmt) -> Option<DependencyBlock> {
    let (binding, expr) = match &stmt.kind {
        StmtKind::Let { name, value } => (BlockBinding::Declare(name.clone()), value),
        StmtKind::Assign { target: AssignTarget::Name(name), value } => {
            (BlockBinding::Assign(name.clone()), value)
        }
        StmtKind::Expr(value) => (BlockBinding::Discard, value),
        _ => return None,
    };
    match &expr.kind {
        ExprKind::Polyglot(block) => Some(DependencyBlock {
            index,
            block: block.clone(),
            binding,
        }),
        // A block nested inside a larger expression has no exactly-known
        // read/write set; the statement serializes as a barrier.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{Expr, Span};
    use crate::polyglot::block::Language;

    fn py_block(bound: &[&str], source: &str) -> PolyglotBlock {
        PolyglotBlock::new(
            Language::Python,
            bound.iter().map(|s| s.to_string()).collect(),
            source,
            Span::default(),
        )
    }

    fn let_block(name: &str, bound: &[&str], source: &str) -> Stmt {
        Stmt::let_(name, Expr::polyglot(py_block(bound, source)))
    }

    fn groups(units: &[ScheduleUnit]) -> Vec<Vec<usize>> {
        units
            .iter()
            .filter_map(|u| match u {
                ScheduleUnit::Group(blocks) => {
                    Some(blocks.iter().map(|b| b.index).collect::<Vec<_>>())
                }
                ScheduleUnit::Barrier(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_independent_blocks_share_a_group() {
        let stmts = vec![
            let_block("a", &[], "return 1"),
            let_block("b", &[], "return 2"),
            let_block("c", &[], "return 3"),
        ];
        let units = analyze(&stmts);
        assert_eq!(groups(&units), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_raw_dependency_splits_groups() {
        let stmts = vec![
            let_block("data", &[], "return [10,20,30]"),
            let_block("s", &["data"], "return sum(data)"),
        ];
        let units = analyze(&stmts);
        assert_eq!(groups(&units), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_waw_dependency_orders_blocks() {
        let stmts = vec![
            let_block("x", &[], "return 1"),
            Stmt::assign("x", Expr::polyglot(py_block(&[], "return 2"))),
        ];
        let units = analyze(&stmts);
        assert_eq!(groups(&units), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_war_dependency_orders_blocks() {
        // Block 0 reads x; block 1 writes x: the write must wait.
        let stmts = vec![
            let_block("y", &["x"], "return x + 1"),
            Stmt::assign("x", Expr::polyglot(py_block(&[], "return 2"))),
        ];
        let units = analyze(&stmts);
        assert_eq!(groups(&units), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_independent_joins_earliest_group() {
        let stmts = vec![
            let_block("a", &[], "return 1"),
            let_block("b", &["a"], "return a"),
            let_block("c", &[], "return 3"),
        ];
        let units = analyze(&stmts);
        // c depends on nothing, so it joins a's group.
        assert_eq!(groups(&units), vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_non_polyglot_statement_is_barrier() {
        let stmts = vec![
            let_block("a", &[], "return 1"),
            Stmt::let_("n", Expr::int(5)),
            let_block("b", &[], "return 2"),
        ];
        let units = analyze(&stmts);
        assert!(matches!(units[0], ScheduleUnit::Group(_)));
        assert!(matches!(units[1], ScheduleUnit::Barrier(1)));
        assert!(matches!(units[2], ScheduleUnit::Group(_)));
        assert_eq!(groups(&units), vec![vec![0], vec![2]]);
    }

    #[test]
    fn test_polyglot_inside_larger_expression_serializes() {
        // A block nested in an arithmetic expression is not analyzable.
        let nested = Expr::binary(
            crate::ast::types::BinaryOp::Add,
            Expr::polyglot(py_block(&[], "return 1")),
            Expr::int(1),
        );
        let stmts = vec![let_block("a", &[], "return 1"), Stmt::let_("b", nested)];
        let units = analyze(&stmts);
        assert!(matches!(units[1], ScheduleUnit::Barrier(1)));
    }

    #[test]
    fn test_index_assignment_target_serializes() {
        let stmts = vec![Stmt::new(StmtKind::Assign {
            target: AssignTarget::Index {
                target: Expr::ident("xs"),
                index: Expr::int(0),
            },
            value: Expr::polyglot(py_block(&[], "return 1")),
        })];
        let units = analyze(&stmts);
        assert!(matches!(units[0], ScheduleUnit::Barrier(0)));
    }
}
