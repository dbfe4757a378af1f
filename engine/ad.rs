//! Operator-overloading reverse-mode automatic differentiation.
//!
//! A recording is started with [`record`], which hands the closure one active
//! variable ([`AVar`]) per input. Every arithmetic operation on active variables
//! appends a node to a thread-local operation list; the closure's return values
//! become the outputs of the finished [`Tape`].
//!
//! Every evaluation routine on a tape is generic over [`Scalar`]. Replaying a
//! finished tape with `AVar` arguments while another recording is active writes
//! the replay (forward, reverse, or forward-over-reverse) onto the active
//! recording. This is how a recording of a Hessian, or of a Newton step, is
//! obtained from a recording of the underlying function.

use std::cell::{Cell, RefCell};
use std::f64::consts::FRAC_2_SQRT_PI;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdError {
    #[error(
        "A recording is already in progress on this thread; nested recordings must replay finished tapes instead of starting a new one."
    )]
    RecordingActive,
}

/// Numeric capability every recorded function is written against.
///
/// Implemented for `f64` (plain evaluation) and [`AVar`] (recording).
pub trait Scalar:
    Copy
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
{
    fn from_f64(value: f64) -> Self;
    fn value(&self) -> f64;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn abs(self) -> Self;
    fn erfc(self) -> Self;
    fn powf(self, exponent: f64) -> Self;

    fn powi(self, exponent: i32) -> Self {
        self.powf(f64::from(exponent))
    }

    /// True only for values that are structurally zero, so skipping them
    /// cannot change any result.
    fn is_identically_zero(&self) -> bool;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn value(&self) -> f64 {
        *self
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn abs(self) -> Self {
        f64::abs(self)
    }

    fn erfc(self) -> Self {
        statrs::function::erf::erfc(self)
    }

    fn powf(self, exponent: f64) -> Self {
        f64::powf(self, exponent)
    }

    fn powi(self, exponent: i32) -> Self {
        f64::powi(self, exponent)
    }

    fn is_identically_zero(&self) -> bool {
        *self == 0.0
    }
}

const CONSTANT_SLOT: u32 = u32::MAX;

/// Operand of a recorded node: an earlier node or a constant captured at
/// recording time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Arg {
    Var(u32),
    Const(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Op {
    Input,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Ln,
    Sqrt,
    Abs,
    Erfc,
    Powf(f64),
}

impl Op {
    pub(crate) fn is_unary(&self) -> bool {
        matches!(
            self,
            Op::Neg | Op::Exp | Op::Ln | Op::Sqrt | Op::Abs | Op::Erfc | Op::Powf(_)
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Node {
    pub(crate) op: Op,
    pub(crate) lhs: Arg,
    pub(crate) rhs: Arg,
}

const INPUT_NODE: Node = Node {
    op: Op::Input,
    lhs: Arg::Const(0.0),
    rhs: Arg::Const(0.0),
};

struct ActiveTape {
    id: u32,
    nodes: Vec<Node>,
}

thread_local! {
    static RECORDING: RefCell<Option<ActiveTape>> = const { RefCell::new(None) };
    static NEXT_TAPE_ID: Cell<u32> = const { Cell::new(0) };
}

/// Clears the thread-local recording when the recording closure returns or unwinds.
struct RecordingGuard;

impl RecordingGuard {
    fn finish(self) -> Vec<Node> {
        RECORDING.with(|cell| cell.borrow_mut().take().map(|tape| tape.nodes).unwrap_or_default())
    }
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        RECORDING.with(|cell| {
            if let Ok(mut active) = cell.try_borrow_mut() {
                active.take();
            }
        });
    }
}

fn push_node(node: Node, tape: u32) -> u32 {
    RECORDING.with(|cell| {
        let mut active = cell.borrow_mut();
        let Some(active) = active.as_mut() else {
            panic!("an active variable was used after its recording finished");
        };
        assert_eq!(
            active.id, tape,
            "active variables from different recordings were mixed"
        );
        assert!(
            active.nodes.len() < CONSTANT_SLOT as usize,
            "recording exceeds the maximum number of operations"
        );
        let slot = active.nodes.len() as u32;
        active.nodes.push(node);
        slot
    })
}

/// A value participating in the active recording, or a constant.
#[derive(Clone, Copy, Debug)]
pub struct AVar {
    value: f64,
    slot: u32,
    tape: u32,
}

impl AVar {
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            slot: CONSTANT_SLOT,
            tape: 0,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.slot != CONSTANT_SLOT
    }

    fn is_constant_equal(&self, target: f64) -> bool {
        !self.is_variable() && self.value == target
    }

    fn arg(&self) -> Arg {
        if self.is_variable() {
            Arg::Var(self.slot)
        } else {
            Arg::Const(self.value)
        }
    }

    fn binary(op: Op, lhs: AVar, rhs: AVar, value: f64) -> AVar {
        let tape = match (lhs.is_variable(), rhs.is_variable()) {
            (false, false) => return AVar::constant(value),
            (true, true) => {
                assert_eq!(
                    lhs.tape, rhs.tape,
                    "active variables from different recordings were mixed"
                );
                lhs.tape
            }
            (true, false) => lhs.tape,
            (false, true) => rhs.tape,
        };
        let slot = push_node(
            Node {
                op,
                lhs: lhs.arg(),
                rhs: rhs.arg(),
            },
            tape,
        );
        AVar { value, slot, tape }
    }

    fn unary(op: Op, operand: AVar, value: f64) -> AVar {
        if !operand.is_variable() {
            return AVar::constant(value);
        }
        let slot = push_node(
            Node {
                op,
                lhs: operand.arg(),
                rhs: Arg::Const(0.0),
            },
            operand.tape,
        );
        AVar {
            value,
            slot,
            tape: operand.tape,
        }
    }
}

impl Add for AVar {
    type Output = AVar;

    fn add(self, rhs: AVar) -> AVar {
        if rhs.is_constant_equal(0.0) {
            return self;
        }
        if self.is_constant_equal(0.0) {
            return rhs;
        }
        AVar::binary(Op::Add, self, rhs, self.value + rhs.value)
    }
}

impl Sub for AVar {
    type Output = AVar;

    fn sub(self, rhs: AVar) -> AVar {
        if rhs.is_constant_equal(0.0) {
            return self;
        }
        if self.is_constant_equal(0.0) {
            return -rhs;
        }
        AVar::binary(Op::Sub, self, rhs, self.value - rhs.value)
    }
}

impl Mul for AVar {
    type Output = AVar;

    fn mul(self, rhs: AVar) -> AVar {
        if self.is_constant_equal(0.0) || rhs.is_constant_equal(0.0) {
            return AVar::constant(0.0);
        }
        if rhs.is_constant_equal(1.0) {
            return self;
        }
        if self.is_constant_equal(1.0) {
            return rhs;
        }
        AVar::binary(Op::Mul, self, rhs, self.value * rhs.value)
    }
}

impl Div for AVar {
    type Output = AVar;

    fn div(self, rhs: AVar) -> AVar {
        if self.is_constant_equal(0.0) && rhs.value != 0.0 {
            return AVar::constant(0.0);
        }
        if rhs.is_constant_equal(1.0) {
            return self;
        }
        AVar::binary(Op::Div, self, rhs, self.value / rhs.value)
    }
}

impl Neg for AVar {
    type Output = AVar;

    fn neg(self) -> AVar {
        AVar::unary(Op::Neg, self, -self.value)
    }
}

macro_rules! scalar_rhs_ops {
    ($($trait:ident $method:ident $assign_trait:ident $assign_method:ident),*) => {
        $(
            impl $trait<f64> for AVar {
                type Output = AVar;

                fn $method(self, rhs: f64) -> AVar {
                    $trait::$method(self, AVar::constant(rhs))
                }
            }

            impl $assign_trait for AVar {
                fn $assign_method(&mut self, rhs: AVar) {
                    *self = $trait::$method(*self, rhs);
                }
            }
        )*
    };
}

scalar_rhs_ops!(
    Add add AddAssign add_assign,
    Sub sub SubAssign sub_assign,
    Mul mul MulAssign mul_assign,
    Div div DivAssign div_assign
);

impl Scalar for AVar {
    fn from_f64(value: f64) -> Self {
        AVar::constant(value)
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn exp(self) -> Self {
        AVar::unary(Op::Exp, self, self.value.exp())
    }

    fn ln(self) -> Self {
        AVar::unary(Op::Ln, self, self.value.ln())
    }

    fn sqrt(self) -> Self {
        AVar::unary(Op::Sqrt, self, self.value.sqrt())
    }

    fn abs(self) -> Self {
        AVar::unary(Op::Abs, self, self.value.abs())
    }

    fn erfc(self) -> Self {
        AVar::unary(Op::Erfc, self, statrs::function::erf::erfc(self.value))
    }

    fn powf(self, exponent: f64) -> Self {
        if exponent == 0.0 {
            return AVar::constant(1.0);
        }
        if exponent == 1.0 {
            return self;
        }
        AVar::unary(Op::Powf(exponent), self, self.value.powf(exponent))
    }

    fn is_identically_zero(&self) -> bool {
        self.is_constant_equal(0.0)
    }
}

/// Records `f` at `point`.
///
/// Operations whose operands are all constants are folded and never taped,
/// so the finished tape only contains operations that depend on the inputs.
pub fn record<F>(point: &[f64], f: F) -> Result<Tape, AdError>
where
    F: FnOnce(&[AVar]) -> Vec<AVar>,
{
    let id = RECORDING.with(|cell| {
        let mut active = cell.borrow_mut();
        if active.is_some() {
            return Err(AdError::RecordingActive);
        }
        let id = NEXT_TAPE_ID.with(|next| {
            let id = next.get();
            next.set(id.wrapping_add(1));
            id
        });
        *active = Some(ActiveTape {
            id,
            nodes: Vec::with_capacity(point.len() * 4),
        });
        Ok(id)
    })?;
    let guard = RecordingGuard;

    let inputs: Vec<AVar> = point
        .iter()
        .map(|&value| AVar {
            value,
            slot: push_node(INPUT_NODE, id),
            tape: id,
        })
        .collect();
    let outputs = f(&inputs);
    let outputs: Vec<Arg> = outputs
        .iter()
        .map(|output| {
            assert!(
                !output.is_variable() || output.tape == id,
                "recorded output belongs to a different recording"
            );
            output.arg()
        })
        .collect();
    let nodes = guard.finish();

    Ok(Tape {
        n_inputs: point.len(),
        nodes,
        outputs,
    })
}

fn operand<T: Scalar>(values: &[T], arg: Arg) -> T {
    match arg {
        Arg::Var(slot) => values[slot as usize],
        Arg::Const(value) => T::from_f64(value),
    }
}

fn tangent<T: Scalar>(dots: &[T], arg: Arg) -> T {
    match arg {
        Arg::Var(slot) => dots[slot as usize],
        Arg::Const(_) => T::from_f64(0.0),
    }
}

fn accumulate<T: Scalar>(bars: &mut [T], arg: Arg, delta: T) {
    if let Arg::Var(slot) = arg {
        if !delta.is_identically_zero() {
            bars[slot as usize] += delta;
        }
    }
}

/// d/dx erfc(x) = −(2/√π)·exp(−x²).
fn erfc_slope<T: Scalar>(a: T) -> T {
    (-(a * a)).exp() * -FRAC_2_SQRT_PI
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// A finished operation sequence mapping `n_inputs` values to its outputs.
///
/// The first `n_inputs` nodes are the inputs in order.
#[derive(Clone, Debug)]
pub struct Tape {
    n_inputs: usize,
    nodes: Vec<Node>,
    outputs: Vec<Arg>,
}

impl Tape {
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Number of recorded operations, inputs excluded.
    pub fn n_operations(&self) -> usize {
        self.nodes.len() - self.n_inputs
    }

    pub fn has_abs(&self) -> bool {
        self.nodes.iter().any(|node| node.op == Op::Abs)
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn output_args(&self) -> &[Arg] {
        &self.outputs
    }

    /// Values of every node at `x`.
    pub fn forward<T: Scalar>(&self, x: &[T]) -> Vec<T> {
        assert_eq!(x.len(), self.n_inputs, "tape input has the wrong length");
        let mut values: Vec<T> = Vec::with_capacity(self.nodes.len());
        values.extend_from_slice(x);
        for node in &self.nodes[self.n_inputs..] {
            let a = operand(&values, node.lhs);
            let value = match node.op {
                Op::Input => a,
                Op::Add => a + operand(&values, node.rhs),
                Op::Sub => a - operand(&values, node.rhs),
                Op::Mul => a * operand(&values, node.rhs),
                Op::Div => a / operand(&values, node.rhs),
                Op::Neg => -a,
                Op::Exp => a.exp(),
                Op::Ln => a.ln(),
                Op::Sqrt => a.sqrt(),
                Op::Abs => a.abs(),
                Op::Erfc => a.erfc(),
                Op::Powf(p) => a.powf(p),
            };
            values.push(value);
        }
        values
    }

    pub fn outputs_from<T: Scalar>(&self, sweep: &[T]) -> Vec<T> {
        self.outputs.iter().map(|&arg| operand(sweep, arg)).collect()
    }

    pub fn eval<T: Scalar>(&self, x: &[T]) -> Vec<T> {
        let sweep = self.forward(x);
        self.outputs_from(&sweep)
    }

    /// Outputs and the gradient of `Σ weights[k]·output[k]` at `x`.
    pub fn gradient<T: Scalar>(&self, x: &[T], weights: &[T]) -> (Vec<T>, Vec<T>) {
        let sweep = self.forward(x);
        let gradient = self.reverse(&sweep, weights);
        (self.outputs_from(&sweep), gradient)
    }

    /// Reverse sweep over a forward `sweep`; returns the input adjoints.
    pub fn reverse<T: Scalar>(&self, sweep: &[T], weights: &[T]) -> Vec<T> {
        assert_eq!(weights.len(), self.outputs.len(), "one weight per output");
        let zero = T::from_f64(0.0);
        let mut bars = vec![zero; self.nodes.len()];
        for (&arg, &weight) in self.outputs.iter().zip(weights) {
            accumulate(&mut bars, arg, weight);
        }

        for index in (self.n_inputs..self.nodes.len()).rev() {
            let bar = bars[index];
            if bar.is_identically_zero() {
                continue;
            }
            let node = self.nodes[index];
            let a = operand(sweep, node.lhs);
            let y = sweep[index];
            match node.op {
                Op::Input => {}
                Op::Add => {
                    accumulate(&mut bars, node.lhs, bar);
                    accumulate(&mut bars, node.rhs, bar);
                }
                Op::Sub => {
                    accumulate(&mut bars, node.lhs, bar);
                    accumulate(&mut bars, node.rhs, -bar);
                }
                Op::Mul => {
                    let b = operand(sweep, node.rhs);
                    accumulate(&mut bars, node.lhs, bar * b);
                    accumulate(&mut bars, node.rhs, bar * a);
                }
                Op::Div => {
                    let b = operand(sweep, node.rhs);
                    accumulate(&mut bars, node.lhs, bar / b);
                    accumulate(&mut bars, node.rhs, -(bar * y) / b);
                }
                Op::Neg => accumulate(&mut bars, node.lhs, -bar),
                Op::Exp => accumulate(&mut bars, node.lhs, bar * y),
                Op::Ln => accumulate(&mut bars, node.lhs, bar / a),
                Op::Sqrt => accumulate(&mut bars, node.lhs, (bar / y) * 0.5),
                Op::Abs => accumulate(&mut bars, node.lhs, bar * sign(a.value())),
                Op::Erfc => accumulate(&mut bars, node.lhs, bar * erfc_slope(a)),
                Op::Powf(p) => accumulate(&mut bars, node.lhs, bar * a.powf(p - 1.0) * p),
            }
        }
        bars.truncate(self.n_inputs);
        bars
    }

    /// Hessian of `Σ weights[k]·output[k]` times `direction`, evaluated on a
    /// forward `sweep` by a tangent sweep followed by a second-order reverse sweep.
    pub fn hessian_times<T: Scalar>(&self, sweep: &[T], weights: &[T], direction: &[T]) -> Vec<T> {
        assert_eq!(weights.len(), self.outputs.len(), "one weight per output");
        assert_eq!(direction.len(), self.n_inputs, "direction has the wrong length");
        let zero = T::from_f64(0.0);
        let n = self.nodes.len();

        let mut dots = vec![zero; n];
        dots[..self.n_inputs].copy_from_slice(direction);
        for index in self.n_inputs..n {
            let node = self.nodes[index];
            let da = tangent(&dots, node.lhs);
            let db = tangent(&dots, node.rhs);
            if da.is_identically_zero() && db.is_identically_zero() {
                continue;
            }
            let a = operand(sweep, node.lhs);
            let y = sweep[index];
            dots[index] = match node.op {
                Op::Input => zero,
                Op::Add => da + db,
                Op::Sub => da - db,
                Op::Mul => da * operand(sweep, node.rhs) + a * db,
                Op::Div => (da - y * db) / operand(sweep, node.rhs),
                Op::Neg => -da,
                Op::Exp => y * da,
                Op::Ln => da / a,
                Op::Sqrt => (da / y) * 0.5,
                Op::Abs => da * sign(a.value()),
                Op::Erfc => da * erfc_slope(a),
                Op::Powf(p) => da * a.powf(p - 1.0) * p,
            };
        }

        let mut bars = vec![zero; n];
        let mut bar_dots = vec![zero; n];
        for (&arg, &weight) in self.outputs.iter().zip(weights) {
            accumulate(&mut bars, arg, weight);
        }

        for index in (self.n_inputs..n).rev() {
            let bar = bars[index];
            let bar_dot = bar_dots[index];
            if bar.is_identically_zero() && bar_dot.is_identically_zero() {
                continue;
            }
            let node = self.nodes[index];
            let a = operand(sweep, node.lhs);
            let da = tangent(&dots, node.lhs);
            let y = sweep[index];
            let dy = dots[index];
            // Each rule adds bar·g' to the adjoint and bar_dot·g' + bar·(g')· to its tangent.
            match node.op {
                Op::Input => {}
                Op::Add => {
                    accumulate(&mut bars, node.lhs, bar);
                    accumulate(&mut bar_dots, node.lhs, bar_dot);
                    accumulate(&mut bars, node.rhs, bar);
                    accumulate(&mut bar_dots, node.rhs, bar_dot);
                }
                Op::Sub => {
                    accumulate(&mut bars, node.lhs, bar);
                    accumulate(&mut bar_dots, node.lhs, bar_dot);
                    accumulate(&mut bars, node.rhs, -bar);
                    accumulate(&mut bar_dots, node.rhs, -bar_dot);
                }
                Op::Neg => {
                    accumulate(&mut bars, node.lhs, -bar);
                    accumulate(&mut bar_dots, node.lhs, -bar_dot);
                }
                Op::Mul => {
                    let b = operand(sweep, node.rhs);
                    let db = tangent(&dots, node.rhs);
                    accumulate(&mut bars, node.lhs, bar * b);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * b + bar * db);
                    accumulate(&mut bars, node.rhs, bar * a);
                    accumulate(&mut bar_dots, node.rhs, bar_dot * a + bar * da);
                }
                Op::Div => {
                    let b = operand(sweep, node.rhs);
                    let db = tangent(&dots, node.rhs);
                    let b2 = b * b;
                    accumulate(&mut bars, node.lhs, bar / b);
                    accumulate(&mut bar_dots, node.lhs, bar_dot / b - bar * db / b2);
                    let g = -y / b;
                    let dg = (y * db - dy * b) / b2;
                    accumulate(&mut bars, node.rhs, bar * g);
                    accumulate(&mut bar_dots, node.rhs, bar_dot * g + bar * dg);
                }
                Op::Exp => {
                    accumulate(&mut bars, node.lhs, bar * y);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * y + bar * dy);
                }
                Op::Ln => {
                    accumulate(&mut bars, node.lhs, bar / a);
                    accumulate(&mut bar_dots, node.lhs, bar_dot / a - bar * da / (a * a));
                }
                Op::Sqrt => {
                    let g = T::from_f64(0.5) / y;
                    let dg = -(dy / (y * y)) * 0.5;
                    accumulate(&mut bars, node.lhs, bar * g);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * g + bar * dg);
                }
                Op::Abs => {
                    let s = sign(a.value());
                    accumulate(&mut bars, node.lhs, bar * s);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * s);
                }
                Op::Erfc => {
                    let g = erfc_slope(a);
                    let dg = g * a * da * -2.0;
                    accumulate(&mut bars, node.lhs, bar * g);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * g + bar * dg);
                }
                Op::Powf(p) => {
                    let g = a.powf(p - 1.0) * p;
                    let dg = da * a.powf(p - 2.0) * (p * (p - 1.0));
                    accumulate(&mut bars, node.lhs, bar * g);
                    accumulate(&mut bar_dots, node.lhs, bar_dot * g + bar * dg);
                }
            }
        }
        bar_dots.truncate(self.n_inputs);
        bar_dots
    }
}
