//! Hessian sparsity detection and colored sparse Hessian evaluation.
//!
//! The Hessian of a recorded function is a sum over its nonlinear operations
//! of `bar_v · J_vᵀ ∇²φ_v J_v`, where `bar_v` is the first-order adjoint of the
//! operation and `J_v` the Jacobian of its operands. A structural nonzero can
//! therefore only come from a nonlinear operation that is reachable from an
//! output, pairing the forward Jacobian sets of its operands. Patterns are
//! computed once per recording and block; numeric values are refreshed with one
//! forward-over-reverse sweep per color of structurally orthogonal columns.

use crate::ad::{Arg, Op, Scalar, Tape};
use crate::types::PackLayout;
use log::{debug, info};
use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::ops::Range;

/// Positions of the structurally nonzero entries of a Hessian block.
///
/// Entries are sorted column-major. For square blocks only `row >= col` is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparsityPattern {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

impl SparsityPattern {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// Index of `(row, col)` in the value vector, if the entry is in the pattern.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.cols.partition_point(|&c| c < col);
        let end = self.cols.partition_point(|&c| c <= col);
        self.rows[start..end]
            .binary_search(&row)
            .ok()
            .map(|offset| start + offset)
    }

    /// The same entries with `row_offset` and `col_offset` subtracted.
    pub fn shifted(&self, row_offset: usize, col_offset: usize) -> SparsityPattern {
        SparsityPattern {
            rows: self.rows.iter().map(|r| r - row_offset).collect(),
            cols: self.cols.iter().map(|c| c - col_offset).collect(),
        }
    }

    /// Entries whose column lies in `col`, in pattern order.
    pub fn column_positions(&self, col: usize) -> Range<usize> {
        let start = self.cols.partition_point(|&c| c < col);
        let end = self.cols.partition_point(|&c| c <= col);
        start..end
    }
}

fn merge_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                merged.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                merged.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                merged.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}

struct PatternCollector {
    rows: Range<usize>,
    cols: Range<usize>,
    square: bool,
    // (col, row) so iteration is column-major.
    entries: BTreeSet<(usize, usize)>,
}

impl PatternCollector {
    fn insert(&mut self, row: usize, col: usize) {
        if !self.rows.contains(&row) || !self.cols.contains(&col) {
            return;
        }
        if self.square && row < col {
            return;
        }
        self.entries.insert((col, row));
    }

    fn cross(&mut self, a: &[u32], b: &[u32]) {
        for &i in a {
            for &j in b {
                self.insert(i as usize, j as usize);
                self.insert(j as usize, i as usize);
            }
        }
    }
}

/// Sparsity of the Hessian of `Σ output` restricted to `row_range × seed_range`.
///
/// `seed_range` selects the differentiation seed (the columns). When the two
/// ranges coincide only the lower triangle is returned.
pub fn hessian_sparsity(
    tape: &Tape,
    seed_range: Range<usize>,
    row_range: Range<usize>,
) -> SparsityPattern {
    let nodes = tape.nodes();
    let n_inputs = tape.n_inputs();
    let n = nodes.len();

    let mut reachable = vec![false; n];
    for arg in tape.output_args() {
        if let Arg::Var(slot) = *arg {
            reachable[slot as usize] = true;
        }
    }
    for index in (n_inputs..n).rev() {
        if !reachable[index] {
            continue;
        }
        for arg in [nodes[index].lhs, nodes[index].rhs] {
            if let Arg::Var(slot) = arg {
                reachable[slot as usize] = true;
            }
        }
    }

    let mut uses = vec![0u32; n];
    for node in &nodes[n_inputs..] {
        for arg in [node.lhs, node.rhs] {
            if let Arg::Var(slot) = arg {
                uses[slot as usize] += 1;
            }
        }
    }

    let tracked = |i: usize| seed_range.contains(&i) || row_range.contains(&i);
    let mut sets: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (i, set) in sets.iter_mut().enumerate().take(n_inputs) {
        if tracked(i) {
            set.push(i as u32);
        }
    }

    let mut collector = PatternCollector {
        rows: row_range.clone(),
        cols: seed_range.clone(),
        square: row_range == seed_range,
        entries: BTreeSet::new(),
    };
    let empty: Vec<u32> = Vec::new();

    for index in n_inputs..n {
        let node = nodes[index];
        let lhs_set = match node.lhs {
            Arg::Var(slot) => &sets[slot as usize],
            Arg::Const(_) => &empty,
        };
        let rhs_set = match node.rhs {
            Arg::Var(slot) => &sets[slot as usize],
            Arg::Const(_) => &empty,
        };

        if reachable[index] {
            match node.op {
                Op::Mul => collector.cross(lhs_set, rhs_set),
                Op::Div => {
                    collector.cross(lhs_set, rhs_set);
                    collector.cross(rhs_set, rhs_set);
                }
                Op::Exp | Op::Ln | Op::Sqrt | Op::Erfc | Op::Powf(_) => collector.cross(lhs_set, lhs_set),
                Op::Input | Op::Add | Op::Sub | Op::Neg | Op::Abs => {}
            }
        }

        let merged = if uses[index] == 0 {
            Vec::new()
        } else if node.op.is_unary() {
            lhs_set.clone()
        } else {
            merge_sorted(lhs_set, rhs_set)
        };
        sets[index] = merged;

        for arg in [node.lhs, node.rhs] {
            if let Arg::Var(slot) = arg {
                let slot = slot as usize;
                uses[slot] -= 1;
                if uses[slot] == 0 {
                    sets[slot] = Vec::new();
                }
            }
        }
    }

    let (cols, rows) = collector.entries.into_iter().unzip();
    SparsityPattern { rows, cols }
}

/// Hessian blocks of a recording over the packed `(θ, u)` layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HessianBlock {
    /// `f_uu`, lower triangle, diagonal always present.
    RandomRandom,
    /// `f_uθ`: rows are random effects, columns fixed effects.
    RandomFixed,
    /// The fixed-effects block, lower triangle.
    FixedFixed,
}

impl HessianBlock {
    fn slot(&self) -> usize {
        match self {
            HessianBlock::RandomRandom => 0,
            HessianBlock::RandomFixed => 1,
            HessianBlock::FixedFixed => 2,
        }
    }

    /// Row range, column range and whether the diagonal is forced into the pattern.
    fn ranges(&self, layout: &PackLayout) -> (Range<usize>, Range<usize>, bool) {
        match self {
            HessianBlock::RandomRandom => (layout.random_range(), layout.random_range(), true),
            HessianBlock::RandomFixed => (layout.random_range(), layout.fixed_range(), false),
            HessianBlock::FixedFixed => (layout.fixed_range(), layout.fixed_range(), false),
        }
    }
}

#[derive(Clone, Debug)]
struct Color {
    columns: Vec<usize>,
    entries: Vec<usize>,
}

/// A Hessian block pattern together with its column coloring.
#[derive(Clone, Debug)]
pub struct SparseHessian {
    pattern: SparsityPattern,
    block_pattern: SparsityPattern,
    colors: Vec<Color>,
}

impl SparseHessian {
    pub fn new(tape: &Tape, rows: Range<usize>, cols: Range<usize>, include_diagonal: bool) -> Self {
        let mut pattern = hessian_sparsity(tape, cols.clone(), rows.clone());
        if include_diagonal && rows == cols {
            let mut entries: BTreeSet<(usize, usize)> = pattern.entries().map(|(r, c)| (c, r)).collect();
            entries.extend(rows.clone().map(|i| (i, i)));
            let (c, r) = entries.into_iter().unzip();
            pattern = SparsityPattern { rows: r, cols: c };
        }
        let colors = color_columns(&pattern, &rows, &cols);
        let block_pattern = pattern.shifted(rows.start, cols.start);
        debug!(
            "Hessian block rows {:?} × cols {:?}: {} entries in {} colors",
            rows,
            cols,
            pattern.len(),
            colors.len()
        );
        Self {
            pattern,
            block_pattern,
            colors,
        }
    }

    /// Pattern in tape input numbering.
    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    /// Pattern relative to the first row and first column of the block.
    pub fn block_pattern(&self) -> &SparsityPattern {
        &self.block_pattern
    }

    pub fn n_colors(&self) -> usize {
        self.colors.len()
    }

    /// Values of `∇² Σ weights[k]·output[k]` at `x`, in pattern order.
    pub fn evaluate<T: Scalar>(&self, tape: &Tape, x: &[T], weights: &[T]) -> Vec<T> {
        let sweep = tape.forward(x);
        self.evaluate_on(tape, &sweep, weights)
    }

    pub fn evaluate_on<T: Scalar>(&self, tape: &Tape, sweep: &[T], weights: &[T]) -> Vec<T> {
        let zero = T::from_f64(0.0);
        let one = T::from_f64(1.0);
        let mut values = vec![zero; self.pattern.len()];
        let mut direction = vec![zero; tape.n_inputs()];
        for color in &self.colors {
            for &c in &color.columns {
                direction[c] = one;
            }
            let product = tape.hessian_times(sweep, weights, &direction);
            for &k in &color.entries {
                values[k] = product[self.pattern.rows[k]];
            }
            for &c in &color.columns {
                direction[c] = zero;
            }
        }
        values
    }
}

/// Greedy coloring: two columns share a color only if no row of the block
/// has a structural nonzero in both.
fn color_columns(pattern: &SparsityPattern, rows: &Range<usize>, cols: &Range<usize>) -> Vec<Color> {
    let square = rows == cols;
    let mut column_rows: Vec<Vec<usize>> = vec![Vec::new(); cols.len()];
    let mut row_columns: Vec<Vec<usize>> = vec![Vec::new(); rows.len()];
    for (r, c) in pattern.entries() {
        column_rows[c - cols.start].push(r);
        row_columns[r - rows.start].push(c);
        if square && r != c {
            column_rows[r - cols.start].push(c);
            row_columns[c - rows.start].push(r);
        }
    }

    let mut assigned: Vec<Option<usize>> = vec![None; cols.len()];
    let mut colors: Vec<Color> = Vec::new();
    let mut forbidden: Vec<usize> = Vec::new();
    for local in 0..cols.len() {
        if column_rows[local].is_empty() {
            continue;
        }
        forbidden.clear();
        for &r in &column_rows[local] {
            for &other in &row_columns[r - rows.start] {
                if let Some(color) = assigned[other - cols.start] {
                    forbidden.push(color);
                }
            }
        }
        let color = (0..).find(|c| !forbidden.contains(c)).unwrap_or(colors.len());
        if color == colors.len() {
            colors.push(Color {
                columns: Vec::new(),
                entries: Vec::new(),
            });
        }
        assigned[local] = Some(color);
        colors[color].columns.push(cols.start + local);
    }

    for (k, (_, c)) in pattern.entries().enumerate() {
        if let Some(color) = assigned[c - cols.start] {
            colors[color].entries.push(k);
        }
    }
    colors
}

/// Lazily computed sparse Hessians of one recording, keyed by block.
#[derive(Debug)]
pub struct SparseHessianCache {
    layout: PackLayout,
    slots: [OnceCell<SparseHessian>; 3],
}

impl SparseHessianCache {
    pub fn new(layout: PackLayout) -> Self {
        Self {
            layout,
            slots: Default::default(),
        }
    }

    pub fn layout(&self) -> PackLayout {
        self.layout
    }

    /// Computes the block's pattern and coloring on first use.
    pub fn get(&self, tape: &Tape, block: HessianBlock) -> &SparseHessian {
        self.slots[block.slot()].get_or_init(|| {
            let (rows, cols, include_diagonal) = block.ranges(&self.layout);
            let hessian = SparseHessian::new(tape, rows, cols, include_diagonal);
            info!(
                "Computed {:?} sparsity: {} entries, {} colors.",
                block,
                hessian.pattern().len(),
                hessian.n_colors()
            );
            hessian
        })
    }
}
