//! A small JSON program description standing in for the real front end and
//! reachability analysis.
//!
//! Each method body is a list of stack-machine ops. The bci of an op is its
//! index plus one; bci 0 is the method entry.
//!
//! ```json
//! {
//!   "methods": [
//!     { "owner": "app.Main", "name": "main",
//!       "ops": [ { "op": "const", "value": { "str": "literal" } },
//!                { "op": "call", "target": "app.Base.f", "virtual": true, "args": 1, "receiver": true },
//!                { "op": "return" } ] }
//!   ],
//!   "roots": ["app.Main.main"],
//!   "implementations": { "app.Base.f": ["app.A.f", "app.B.f"] }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use deferc_config::VariantKind;
use deferc_ir::{
    ArithOp, CallKind, Constant, FrameStateData, Graph, HeapObject, InvokeData, Node, NodeId,
    NodeKind, ObjectRef,
};
use deferc_symbol::{MethodFlags, MethodId, MethodTable};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ParseFailure;
use crate::host::{CallSiteRef, CalleeSize, FrontEnd, ReachabilityOracle};
use crate::inline::ParseContext;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("malformed program description: {0}")]
    Json(#[from] serde_json::Error),

    #[error("method {0} is declared twice")]
    DuplicateMethod(String),

    #[error("unknown method '{name}' referenced by {referenced_by}")]
    UnknownMethod { name: String, referenced_by: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramScript {
    pub methods: Vec<MethodScript>,

    #[serde(default)]
    pub roots: Vec<String>,

    /// Methods the analysis considers unreachable.
    #[serde(default)]
    pub unreachable: Vec<String>,

    /// Methods that only become reachable once the analysis advances.
    #[serde(default)]
    pub reachable_later: Vec<String>,

    /// Declared virtual method to its concrete implementations.
    #[serde(default)]
    pub implementations: BTreeMap<String, Vec<String>>,
}

fn default_signature() -> String {
    "()".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodScript {
    pub owner: String,
    pub name: String,

    #[serde(default = "default_signature")]
    pub signature: String,

    #[serde(default)]
    pub ops: Vec<Op>,

    #[serde(default)]
    pub never_inline: bool,

    #[serde(default)]
    pub no_deferred: bool,

    #[serde(default = "default_true")]
    pub has_body: bool,

    /// Make the front end fail on this method with the given reason.
    #[serde(default)]
    pub fail: Option<String>,
}

impl MethodScript {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, ops: Vec<Op>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            signature: default_signature(),
            ops,
            never_inline: false,
            no_deferred: false,
            has_body: true,
            fail: None,
        }
    }

    fn key(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }

    fn flags(&self) -> MethodFlags {
        MethodFlags {
            has_body: self.has_body,
            never_inline: self.never_inline,
            allow_deferred: !self.no_deferred,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arith {
    Add,
    Sub,
    Mul,
}

impl From<Arith> for ArithOp {
    fn from(op: Arith) -> Self {
        match op {
            Arith::Add => ArithOp::Add,
            Arith::Sub => ArithOp::Sub,
            Arith::Mul => ArithOp::Mul,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Const {
        value: Value,
    },
    Param {
        index: u32,
    },
    Arith {
        #[serde(rename = "operator")]
        op: Arith,
    },
    /// Pops `args` operands, the receiver first when `receiver` is set.
    Call {
        target: String,
        #[serde(default, rename = "virtual")]
        is_virtual: bool,
        #[serde(default)]
        args: u32,
        #[serde(default)]
        receiver: bool,
        #[serde(default)]
        catches: bool,
    },
    StackAlloc {
        size: u32,
    },
    Return,
}

impl Op {
    pub fn call(target: impl Into<String>) -> Self {
        Op::Call {
            target: target.into(),
            is_virtual: false,
            args: 0,
            receiver: false,
            catches: false,
        }
    }

    pub fn virtual_call(target: impl Into<String>) -> Self {
        Op::Call {
            target: target.into(),
            is_virtual: true,
            args: 1,
            receiver: true,
            catches: false,
        }
    }

    pub fn string(text: impl Into<String>) -> Self {
        Op::Const {
            value: Value::Str(text.into()),
        }
    }
}

/// An op with names resolved and string literals interned.
#[derive(Debug, Clone)]
enum ResolvedOp {
    Const(Constant),
    Param(u32),
    Arith(ArithOp),
    Call {
        target: MethodId,
        kind: CallKind,
        args: u32,
        receiver: bool,
        catches: bool,
    },
    StackAlloc(u32),
    Return,
}

#[derive(Debug)]
struct Body {
    ops: Vec<ResolvedOp>,
    fail: Option<String>,
}

impl ProgramScript {
    pub fn from_json(text: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Declare every method and resolve every reference.
    pub fn load(&self) -> Result<LoadedProgram, ScriptError> {
        let methods = MethodTable::new();
        let mut seen = AHashSet::new();
        for method in &self.methods {
            if !seen.insert(method.key()) {
                return Err(ScriptError::DuplicateMethod(method.key()));
            }
            methods.declare(
                method.owner.as_str(),
                method.name.as_str(),
                method.signature.as_str(),
                method.flags(),
            );
        }

        let resolve = |name: &str, referenced_by: &str| {
            methods
                .resolve(name)
                .ok_or_else(|| ScriptError::UnknownMethod {
                    name: name.to_string(),
                    referenced_by: referenced_by.to_string(),
                })
        };

        let mut literals: AHashMap<String, ObjectRef> = AHashMap::new();
        let mut bodies = AHashMap::new();
        for method in &self.methods {
            let id = resolve(&method.key(), "the method list")?;
            if !method.has_body {
                continue;
            }
            let mut ops = Vec::with_capacity(method.ops.len());
            for op in &method.ops {
                let resolved = match op {
                    Op::Const { value } => ResolvedOp::Const(match value {
                        Value::Null => Constant::Null,
                        Value::Int(v) => Constant::Int(*v),
                        Value::Float(v) => Constant::Float(v.to_bits()),
                        Value::Str(text) => Constant::Object(Arc::clone(
                            literals
                                .entry(text.clone())
                                .or_insert_with(|| HeapObject::string(text.as_str())),
                        )),
                    }),
                    Op::Param { index } => ResolvedOp::Param(*index),
                    Op::Arith { op } => ResolvedOp::Arith((*op).into()),
                    Op::Call {
                        target,
                        is_virtual,
                        args,
                        receiver,
                        catches,
                    } => ResolvedOp::Call {
                        target: resolve(target, &method.key())?,
                        kind: if *is_virtual {
                            CallKind::Virtual
                        } else {
                            CallKind::Static
                        },
                        args: *args,
                        receiver: *receiver,
                        catches: *catches,
                    },
                    Op::StackAlloc { size } => ResolvedOp::StackAlloc(*size),
                    Op::Return => ResolvedOp::Return,
                };
                ops.push(resolved);
            }
            bodies.insert(
                id,
                Body {
                    ops,
                    fail: method.fail.clone(),
                },
            );
        }

        let roots = self
            .roots
            .iter()
            .map(|name| resolve(name, "the root list"))
            .collect::<Result<Vec<_>, _>>()?;
        let unreachable = self
            .unreachable
            .iter()
            .map(|name| resolve(name, "the unreachable list"))
            .collect::<Result<AHashSet<_>, _>>()?;
        let later = self
            .reachable_later
            .iter()
            .map(|name| resolve(name, "the reachable-later list"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut implementations = AHashMap::new();
        for (declared, impls) in &self.implementations {
            let declared_id = resolve(declared, "the implementation map")?;
            let impls = impls
                .iter()
                .map(|name| resolve(name, declared))
                .collect::<Result<Vec<_>, _>>()?;
            implementations.insert(declared_id, impls);
        }

        let mut hidden = unreachable;
        hidden.extend(later.iter().copied());
        debug!(
            methods = methods.len(),
            literals = literals.len(),
            roots = roots.len(),
            "loaded program description"
        );
        Ok(LoadedProgram {
            methods,
            front_end: ScriptFrontEnd { bodies },
            oracle: ScriptOracle {
                hidden: RwLock::new(hidden),
                later: Mutex::new(later),
                implementations,
                discovered: Mutex::new(Vec::new()),
            },
            roots,
        })
    }
}

pub struct LoadedProgram {
    pub methods: MethodTable,
    pub front_end: ScriptFrontEnd,
    pub oracle: ScriptOracle,
    pub roots: Vec<MethodId>,
}

pub struct ScriptFrontEnd {
    bodies: AHashMap<MethodId, Body>,
}

impl FrontEnd for ScriptFrontEnd {
    fn build_graph(&self, method: MethodId, ctx: &mut ParseContext<'_>) -> Result<Graph, ParseFailure> {
        let body = self.body(method)?;
        if let Some(reason) = &body.fail {
            return Err(ParseFailure::new(reason.clone()));
        }

        let mut lowering = Lowering::new(self, method, ctx.kind() == VariantKind::DeoptTarget);
        let result = lowering.lower(ctx, method, None, None)?;
        let ret = Node::new(NodeKind::Return).with_inputs(result.into_iter().collect());
        lowering.append(ret);

        let mut graph = lowering.graph;
        for inlined in ctx.inlined_methods() {
            graph.record_inlined(*inlined);
        }
        graph.remove_dead_code();
        graph.verify().map_err(ParseFailure::new)?;
        Ok(graph)
    }

    fn estimated_size(&self, method: MethodId) -> Option<CalleeSize> {
        let body = self.bodies.get(&method)?;
        let invokes = body
            .ops
            .iter()
            .filter(|op| matches!(op, ResolvedOp::Call { .. }))
            .count();
        Some(CalleeSize {
            nodes: body.ops.len() as u32 + 1,
            invokes: invokes as u32,
        })
    }
}

impl ScriptFrontEnd {
    fn body(&self, method: MethodId) -> Result<&Body, ParseFailure> {
        self.bodies
            .get(&method)
            .ok_or_else(|| ParseFailure::new(format!("{method} has no body")))
    }
}

/// Builds one graph from a method body and the bodies inlined into it.
struct Lowering<'f> {
    front_end: &'f ScriptFrontEnd,
    graph: Graph,
    last: NodeId,
    /// Exception handler waiting for the invoke's normal successor.
    pending_handler: Option<(NodeId, NodeId)>,
    deopt_entries: bool,
    params: AHashMap<u32, NodeId>,
}

impl<'f> Lowering<'f> {
    fn new(front_end: &'f ScriptFrontEnd, method: MethodId, deopt_entries: bool) -> Self {
        let mut graph = Graph::new(method);
        let start = graph.start();
        let entry = graph.add(Node::new(NodeKind::FrameState(FrameStateData {
            method,
            bci: 0,
            during_call: false,
            rethrow: false,
        })));
        if let Some(node) = graph.node_mut(start) {
            node.state = Some(entry);
        }
        let mut lowering = Self {
            front_end,
            graph,
            last: start,
            pending_handler: None,
            deopt_entries,
            params: AHashMap::new(),
        };
        if deopt_entries {
            lowering.append(Node::new(NodeKind::DeoptEntry).with_state(entry));
        }
        lowering
    }

    fn append(&mut self, node: Node) -> NodeId {
        let id = self.graph.add(node);
        self.graph.set_next(self.last, id);
        if let Some((invoke, handler)) = self.pending_handler {
            if invoke == self.last {
                if let Some(node) = self.graph.node_mut(invoke) {
                    node.successors.push(handler);
                }
                self.pending_handler = None;
            }
        }
        self.last = id;
        id
    }

    fn state(
        &mut self,
        method: MethodId,
        bci: i32,
        during_call: bool,
        rethrow: bool,
        outer: Option<NodeId>,
    ) -> NodeId {
        let mut node = Node::new(NodeKind::FrameState(FrameStateData {
            method,
            bci,
            during_call,
            rethrow,
        }));
        node.state = outer;
        self.graph.add(node)
    }

    /// Lower `method`'s body. `args` is `None` for the graph's own method and
    /// the call's operands for an inlined callee; `outer` is the caller state
    /// enclosing every state of an inlined body. Returns the returned value.
    fn lower(
        &mut self,
        ctx: &mut ParseContext<'_>,
        method: MethodId,
        args: Option<&[NodeId]>,
        outer: Option<NodeId>,
    ) -> Result<Option<NodeId>, ParseFailure> {
        let front_end = self.front_end;
        let body = front_end.body(method)?;
        if let Some(reason) = &body.fail {
            return Err(ParseFailure::new(reason.clone()));
        }

        let mut stack: Vec<NodeId> = Vec::new();
        for (idx, op) in body.ops.iter().enumerate() {
            let bci = idx as i32 + 1;
            match op {
                ResolvedOp::Const(constant) => {
                    stack.push(self.graph.add(Node::new(NodeKind::Constant(constant.clone()))));
                }
                ResolvedOp::Param(index) => {
                    let value = match args {
                        Some(args) => args.get(*index as usize).copied().ok_or_else(|| {
                            ParseFailure::new(format!("parameter {index} out of range at bci {bci}"))
                        })?,
                        None => *self.params.entry(*index).or_insert_with(|| {
                            self.graph.add(Node::new(NodeKind::Parameter { index: *index }))
                        }),
                    };
                    stack.push(value);
                }
                ResolvedOp::Arith(op) => {
                    let operands = pop(&mut stack, 2, bci)?;
                    stack.push(
                        self.graph
                            .add(Node::new(NodeKind::Arithmetic { op: *op }).with_inputs(operands)),
                    );
                }
                ResolvedOp::StackAlloc(size) => {
                    stack.push(self.append(Node::new(NodeKind::StackValue { size: *size })));
                }
                ResolvedOp::Return => return Ok(stack.pop()),
                ResolvedOp::Call {
                    target,
                    kind,
                    args: arity,
                    receiver,
                    catches,
                } => {
                    let operands = pop(&mut stack, *arity as usize, bci)?;

                    let size = match kind {
                        CallKind::Static => front_end.estimated_size(*target),
                        CallKind::Virtual => None,
                    };
                    if let Some(size) = size {
                        if ctx.try_inline(*target, size) {
                            let call_state = self.state(method, bci, true, false, outer);
                            let result = self.lower(ctx, *target, Some(&operands), Some(call_state));
                            ctx.finish_inline();
                            if let Some(value) = result? {
                                stack.push(value);
                            }
                            continue;
                        }
                    }

                    let data = InvokeData {
                        target: *target,
                        declared: *target,
                        kind: *kind,
                        bci,
                        has_receiver: *receiver,
                    };
                    if self.deopt_entries {
                        let during = self.state(method, bci, true, false, outer);
                        self.append(Node::new(NodeKind::DeoptEntry).with_state(during));
                    }
                    let after = self.state(method, bci, false, false, outer);
                    let invoke_kind = if *catches {
                        NodeKind::InvokeWithException(data)
                    } else {
                        NodeKind::Invoke(data)
                    };
                    let invoke = self.append(
                        Node::new(invoke_kind)
                            .with_inputs(operands)
                            .with_state(after),
                    );
                    if *catches {
                        let rethrow = self.state(method, bci, false, true, outer);
                        let exception = self
                            .graph
                            .add(Node::new(NodeKind::ExceptionObject).with_state(rethrow));
                        let unwind = self
                            .graph
                            .add(Node::new(NodeKind::Unwind).with_inputs(vec![exception]));
                        self.graph.set_next(exception, unwind);
                        if self.deopt_entries {
                            self.graph.insert_after(
                                exception,
                                Node::new(NodeKind::DeoptEntry).with_state(rethrow),
                            );
                        }
                        self.pending_handler = Some((invoke, exception));
                    }
                    if self.deopt_entries {
                        self.append(Node::new(NodeKind::DeoptEntry).with_state(after));
                    }
                    stack.push(invoke);
                }
            }
        }
        Ok(stack.pop())
    }
}

fn pop(stack: &mut Vec<NodeId>, count: usize, bci: i32) -> Result<Vec<NodeId>, ParseFailure> {
    if stack.len() < count {
        return Err(ParseFailure::new(format!("operand stack underflow at bci {bci}")));
    }
    Ok(stack.split_off(stack.len() - count))
}

/// Reachability facts read from the program description.
pub struct ScriptOracle {
    hidden: RwLock<AHashSet<MethodId>>,
    later: Mutex<Vec<MethodId>>,
    implementations: AHashMap<MethodId, Vec<MethodId>>,
    discovered: Mutex<Vec<(MethodId, VariantKind)>>,
}

impl ScriptOracle {
    /// Variants reported through [`ReachabilityOracle::on_new_method_discovered`].
    pub fn discovered(&self) -> Vec<(MethodId, VariantKind)> {
        self.discovered.lock().clone()
    }
}

impl ReachabilityOracle for ScriptOracle {
    fn callees_of(&self, site: &CallSiteRef) -> Vec<MethodId> {
        let candidates = match site.kind {
            CallKind::Static => vec![site.target],
            CallKind::Virtual => self
                .implementations
                .get(&site.declared)
                .cloned()
                .unwrap_or_else(|| vec![site.declared]),
        };
        let hidden = self.hidden.read();
        candidates
            .into_iter()
            .filter(|method| !hidden.contains(method))
            .collect()
    }

    fn is_reachable(&self, method: MethodId) -> bool {
        !self.hidden.read().contains(&method)
    }

    fn on_new_method_discovered(&self, method: MethodId, kind: VariantKind) {
        self.discovered.lock().push((method, kind));
    }

    fn advance(&self) -> bool {
        let revived: Vec<MethodId> = std::mem::take(&mut *self.later.lock());
        if revived.is_empty() {
            return false;
        }
        let mut hidden = self.hidden.write();
        for method in &revived {
            hidden.remove(method);
        }
        debug!(revived = revived.len(), "analysis advanced");
        true
    }
}
