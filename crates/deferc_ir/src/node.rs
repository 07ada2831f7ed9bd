use std::fmt;
use std::sync::Arc;

use deferc_symbol::MethodId;

use crate::object::ObjectRef;

/// Index of a node inside its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Static,
    Virtual,
}

/// Why a guard or deoptimize node abandons compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    UnreachedCode,
    NullCheckException,
    TransferToInterpreter,
}

impl DeoptReason {
    pub fn to_u8(self) -> u8 {
        match self {
            DeoptReason::UnreachedCode => 0,
            DeoptReason::NullCheckException => 1,
            DeoptReason::TransferToInterpreter => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeoptReason::UnreachedCode),
            1 => Some(DeoptReason::NullCheckException),
            2 => Some(DeoptReason::TransferToInterpreter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    pub fn to_u8(self) -> u8 {
        match self {
            ArithOp::Add => 0,
            ArithOp::Sub => 1,
            ArithOp::Mul => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ArithOp::Add),
            1 => Some(ArithOp::Sub),
            2 => Some(ArithOp::Mul),
            _ => None,
        }
    }
}

/// A constant operand.
#[derive(Debug, Clone)]
pub enum Constant {
    Null,
    Int(i64),
    /// Raw IEEE-754 bits so that constants compare and hash exactly.
    Float(u64),
    Object(ObjectRef),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a == b,
            (Constant::Object(a), Constant::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Constant {}

/// Call site payload shared by both invoke flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvokeData {
    /// The method the call resolves to statically.
    pub target: MethodId,
    /// The declared target, which differs from `target` under virtual dispatch.
    pub declared: MethodId,
    pub kind: CallKind,
    pub bci: i32,
    /// The first argument input is the receiver.
    pub has_receiver: bool,
}

/// Snapshot of live values at one program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameStateData {
    pub method: MethodId,
    /// Negative values are synthetic points that can never be re-entered.
    pub bci: i32,
    pub during_call: bool,
    pub rethrow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Parameter { index: u32 },
    Constant(Constant),
    Arithmetic { op: ArithOp },
    IsNull,
    Invoke(InvokeData),
    InvokeWithException(InvokeData),
    ExceptionObject,
    /// Fails when its condition input is true (or false when `negated`).
    /// Without a condition input the guard fails unconditionally.
    FixedGuard { reason: DeoptReason, negated: bool },
    Deoptimize { reason: DeoptReason },
    /// Stack-allocated memory, which cannot survive deoptimization.
    StackValue { size: u32 },
    /// Re-entry point of a DeoptTarget graph; the node's state is the frame it restores.
    DeoptEntry,
    /// Lightweight anchor keeping an inlined call boundary alive.
    DeoptProxyAnchor,
    FrameState(FrameStateData),
    Return,
    Unwind,
}

impl NodeKind {
    /// Nodes that take part in the control-flow chain.
    pub fn is_fixed(&self) -> bool {
        !matches!(
            self,
            NodeKind::Parameter { .. }
                | NodeKind::Constant(_)
                | NodeKind::Arithmetic { .. }
                | NodeKind::IsNull
                | NodeKind::FrameState(_)
        )
    }

    pub fn invoke(&self) -> Option<&InvokeData> {
        match self {
            NodeKind::Invoke(data) | NodeKind::InvokeWithException(data) => Some(data),
            _ => None,
        }
    }

    pub fn frame_state(&self) -> Option<&FrameStateData> {
        match self {
            NodeKind::FrameState(data) => Some(data),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::Parameter { .. } => "Parameter",
            NodeKind::Constant(_) => "Constant",
            NodeKind::Arithmetic { .. } => "Arithmetic",
            NodeKind::IsNull => "IsNull",
            NodeKind::Invoke(_) => "Invoke",
            NodeKind::InvokeWithException(_) => "InvokeWithException",
            NodeKind::ExceptionObject => "ExceptionObject",
            NodeKind::FixedGuard { .. } => "FixedGuard",
            NodeKind::Deoptimize { .. } => "Deoptimize",
            NodeKind::StackValue { .. } => "StackValue",
            NodeKind::DeoptEntry => "DeoptEntry",
            NodeKind::DeoptProxyAnchor => "DeoptProxyAnchor",
            NodeKind::FrameState(_) => "FrameState",
            NodeKind::Return => "Return",
            NodeKind::Unwind => "Unwind",
        }
    }
}

/// One operation in a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    /// Data edges.
    pub inputs: Vec<NodeId>,
    /// Control edges; an exception edge, if any, is the second successor.
    pub successors: Vec<NodeId>,
    /// The frame state describing this node, or the enclosing state of a frame state.
    pub state: Option<NodeId>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            successors: Vec::new(),
            state: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<NodeId>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_state(mut self, state: NodeId) -> Self {
        self.state = Some(state);
        self
    }

    pub fn next(&self) -> Option<NodeId> {
        self.successors.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HeapObject;

    #[test]
    fn object_constants_compare_by_identity() {
        let literal = HeapObject::string("literal");
        let same = Constant::Object(Arc::clone(&literal));
        let copy = Constant::Object(HeapObject::string("literal"));

        assert_eq!(Constant::Object(literal), same);
        assert_ne!(same, copy);
        assert_ne!(Constant::Int(1), Constant::Float(1));
    }

    #[test]
    fn floating_nodes_are_not_fixed() {
        assert!(!NodeKind::Constant(Constant::Null).is_fixed());
        assert!(!NodeKind::IsNull.is_fixed());
        assert!(NodeKind::DeoptEntry.is_fixed());
        assert!(NodeKind::Deoptimize { reason: DeoptReason::UnreachedCode }.is_fixed());
    }
}
