//! Graph encoding.
//!
//! Layout of one encoded graph, starting at the offset `encode` returns:
//!
//! ```text
//! uv   method object id
//! uv   live node count N
//! u8   order-id width (1, 2 or 4 bytes)
//! uv   inlined method count, then one object id each
//! N x  node: u8 tag, payload, inputs, successors, state
//! ```
//!
//! Nodes are renumbered densely in arena order; order id 0 means "no node" and
//! the node at arena position `i` gets order id `i + 1`. Edge lists are a
//! varint count followed by fixed-width order ids.

use std::sync::Arc;

use ahash::AHashMap;
use deferc_ir::{CallKind, Constant, Graph, InvokeData, Node, NodeId, NodeKind, ObjectRef};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CodecError;
use crate::replace::{IdentityReplacer, ObjectReplacer};
use crate::stream::TypeWriter;
use crate::table::{ObjectTable, TableObject};

pub(crate) const NULL_ORDER_ID: u32 = 0;

pub(crate) mod tag {
    pub const START: u8 = 0;
    pub const PARAMETER: u8 = 1;
    pub const CONSTANT: u8 = 2;
    pub const ARITHMETIC: u8 = 3;
    pub const IS_NULL: u8 = 4;
    pub const INVOKE: u8 = 5;
    pub const INVOKE_WITH_EXCEPTION: u8 = 6;
    pub const EXCEPTION_OBJECT: u8 = 7;
    pub const FIXED_GUARD: u8 = 8;
    pub const DEOPTIMIZE: u8 = 9;
    pub const STACK_VALUE: u8 = 10;
    pub const DEOPT_ENTRY: u8 = 11;
    pub const DEOPT_PROXY_ANCHOR: u8 = 12;
    pub const FRAME_STATE: u8 = 13;
    pub const RETURN: u8 = 14;
    pub const UNWIND: u8 = 15;

    pub const CONST_NULL: u8 = 0;
    pub const CONST_INT: u8 = 1;
    pub const CONST_FLOAT: u8 = 2;
    pub const CONST_OBJECT: u8 = 3;

    pub const CALL_STATIC: u8 = 0;
    pub const CALL_VIRTUAL: u8 = 1;

    pub const STATE_DURING_CALL: u8 = 1;
    pub const STATE_RETHROW: u8 = 2;
}

/// Bytes needed to store order ids for a graph of `node_count` live nodes.
pub(crate) fn order_id_width(node_count: usize) -> u8 {
    match node_count + 1 {
        n if n <= u8::MAX as usize => 1,
        n if n <= u16::MAX as usize => 2,
        _ => 4,
    }
}

/// Everything the runtime needs to rebuild graphs: the shared byte buffer and
/// the object table it indexes into.
#[derive(Debug, Clone, Default)]
pub struct EncodedArtifact {
    pub encoding: Vec<u8>,
    pub objects: ObjectTable,
}

/// Encodes many graphs into one buffer sharing one object table.
///
/// Usage is two-phase: `prepare` every graph, `finish_prepare`, then `encode`.
pub struct GraphEncoder {
    objects: ObjectTable,
    writer: TypeWriter,
    replacer: Arc<dyn ObjectReplacer>,
    graphs_encoded: usize,
}

impl Default for GraphEncoder {
    fn default() -> Self {
        Self::new(Arc::new(IdentityReplacer))
    }
}

impl GraphEncoder {
    pub fn new(replacer: Arc<dyn ObjectReplacer>) -> Self {
        Self {
            objects: ObjectTable::new(),
            writer: TypeWriter::new(),
            replacer,
            graphs_encoded: 0,
        }
    }

    pub fn replacer(&self) -> Arc<dyn ObjectReplacer> {
        Arc::clone(&self.replacer)
    }

    /// Register every object and method `graph` references.
    pub fn prepare(&mut self, graph: &Graph) -> Result<(), CodecError> {
        for entry in self.references(graph) {
            self.objects.add(entry)?;
        }
        Ok(())
    }

    pub fn finish_prepare(&mut self) {
        self.objects.freeze();
        debug!(objects = self.objects.len(), "object table frozen");
    }

    fn references(&self, graph: &Graph) -> Vec<TableObject> {
        let mut refs = vec![TableObject::Method(graph.method())];
        refs.extend(graph.inlined_methods().iter().copied().map(TableObject::Method));
        for (_, node) in graph.iter() {
            match &node.kind {
                NodeKind::Constant(Constant::Object(object)) => {
                    refs.push(TableObject::Object(self.replacer.to_runtime(object)));
                }
                NodeKind::Invoke(data) | NodeKind::InvokeWithException(data) => {
                    refs.push(TableObject::Method(data.target));
                    refs.push(TableObject::Method(data.declared));
                }
                NodeKind::FrameState(state) => refs.push(TableObject::Method(state.method)),
                _ => {}
            }
        }
        refs
    }

    fn object_id(&self, object: &ObjectRef) -> Result<u32, CodecError> {
        self.objects
            .id_of(&TableObject::Object(self.replacer.to_runtime(object)))
    }

    fn method_id(&self, method: deferc_symbol::MethodId) -> Result<u32, CodecError> {
        self.objects.id_of(&TableObject::Method(method))
    }

    /// Append `graph` to the shared buffer and return its start offset.
    pub fn encode(&mut self, graph: &Graph) -> Result<usize, CodecError> {
        if !self.objects.is_frozen() {
            return Err(CodecError::TableNotFrozen);
        }

        let live: Vec<NodeId> = graph.iter().map(|(id, _)| id).collect();
        let order: AHashMap<NodeId, u32> = live
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx as u32 + 1))
            .collect();
        let width = order_id_width(live.len());

        // Resolve every id before touching the buffer so a failure leaves it unchanged.
        let mut out = TypeWriter::new();
        out.put_uv(u64::from(self.method_id(graph.method())?));
        out.put_uv(live.len() as u64);
        out.put_u8(width);
        out.put_uv(graph.inlined_methods().len() as u64);
        for method in graph.inlined_methods() {
            out.put_uv(u64::from(self.method_id(*method)?));
        }
        for id in &live {
            if let Some(node) = graph.node(*id) {
                self.write_node(&mut out, node, &order, width)?;
            }
        }

        let offset = self.writer.position();
        self.writer.put_raw(out.bytes());
        self.graphs_encoded += 1;
        Ok(offset)
    }

    fn write_node(
        &self,
        out: &mut TypeWriter,
        node: &Node,
        order: &AHashMap<NodeId, u32>,
        width: u8,
    ) -> Result<(), CodecError> {
        match &node.kind {
            NodeKind::Start => out.put_u8(tag::START),
            NodeKind::Parameter { index } => {
                out.put_u8(tag::PARAMETER);
                out.put_uv(u64::from(*index));
            }
            NodeKind::Constant(constant) => {
                out.put_u8(tag::CONSTANT);
                match constant {
                    Constant::Null => out.put_u8(tag::CONST_NULL),
                    Constant::Int(value) => {
                        out.put_u8(tag::CONST_INT);
                        out.put_sv(*value);
                    }
                    Constant::Float(bits) => {
                        out.put_u8(tag::CONST_FLOAT);
                        out.put_uv(*bits);
                    }
                    Constant::Object(object) => {
                        out.put_u8(tag::CONST_OBJECT);
                        out.put_uv(u64::from(self.object_id(object)?));
                    }
                }
            }
            NodeKind::Arithmetic { op } => {
                out.put_u8(tag::ARITHMETIC);
                out.put_u8(op.to_u8());
            }
            NodeKind::IsNull => out.put_u8(tag::IS_NULL),
            NodeKind::Invoke(data) => {
                out.put_u8(tag::INVOKE);
                self.write_invoke(out, data)?;
            }
            NodeKind::InvokeWithException(data) => {
                out.put_u8(tag::INVOKE_WITH_EXCEPTION);
                self.write_invoke(out, data)?;
            }
            NodeKind::ExceptionObject => out.put_u8(tag::EXCEPTION_OBJECT),
            NodeKind::FixedGuard { reason, negated } => {
                out.put_u8(tag::FIXED_GUARD);
                out.put_u8(reason.to_u8());
                out.put_u8(u8::from(*negated));
            }
            NodeKind::Deoptimize { reason } => {
                out.put_u8(tag::DEOPTIMIZE);
                out.put_u8(reason.to_u8());
            }
            NodeKind::StackValue { size } => {
                out.put_u8(tag::STACK_VALUE);
                out.put_uv(u64::from(*size));
            }
            NodeKind::DeoptEntry => out.put_u8(tag::DEOPT_ENTRY),
            NodeKind::DeoptProxyAnchor => out.put_u8(tag::DEOPT_PROXY_ANCHOR),
            NodeKind::FrameState(state) => {
                out.put_u8(tag::FRAME_STATE);
                out.put_uv(u64::from(self.method_id(state.method)?));
                out.put_sv(i64::from(state.bci));
                let mut flags = 0;
                if state.during_call {
                    flags |= tag::STATE_DURING_CALL;
                }
                if state.rethrow {
                    flags |= tag::STATE_RETHROW;
                }
                out.put_u8(flags);
            }
            NodeKind::Return => out.put_u8(tag::RETURN),
            NodeKind::Unwind => out.put_u8(tag::UNWIND),
        }

        write_edges(out, &node.inputs, order, width);
        write_edges(out, &node.successors, order, width);
        let state = node
            .state
            .and_then(|state| order.get(&state).copied())
            .unwrap_or(NULL_ORDER_ID);
        write_order_id(out, state, width);
        Ok(())
    }

    fn write_invoke(&self, out: &mut TypeWriter, data: &InvokeData) -> Result<(), CodecError> {
        out.put_uv(u64::from(self.method_id(data.target)?));
        out.put_uv(u64::from(self.method_id(data.declared)?));
        out.put_u8(match data.kind {
            CallKind::Static => tag::CALL_STATIC,
            CallKind::Virtual => tag::CALL_VIRTUAL,
        });
        out.put_sv(i64::from(data.bci));
        out.put_u8(u8::from(data.has_receiver));
        Ok(())
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn encoding(&self) -> &[u8] {
        self.writer.bytes()
    }

    pub fn graphs_encoded(&self) -> usize {
        self.graphs_encoded
    }

    pub fn into_artifact(self) -> EncodedArtifact {
        EncodedArtifact {
            encoding: self.writer.into_bytes(),
            objects: self.objects,
        }
    }
}

fn write_edges(out: &mut TypeWriter, edges: &[NodeId], order: &AHashMap<NodeId, u32>, width: u8) {
    out.put_uv(edges.len() as u64);
    for edge in edges {
        let id = order.get(edge).copied().unwrap_or(NULL_ORDER_ID);
        write_order_id(out, id, width);
    }
}

fn write_order_id(out: &mut TypeWriter, id: u32, width: u8) {
    match width {
        1 => out.put_u8(id as u8),
        2 => out.put_u16(id as u16),
        _ => out.put_u32(id),
    }
}

/// A [`GraphEncoder`] that worker threads can share.
pub struct SharedGraphEncoder {
    inner: Mutex<GraphEncoder>,
}

impl SharedGraphEncoder {
    pub fn new(encoder: GraphEncoder) -> Self {
        Self {
            inner: Mutex::new(encoder),
        }
    }

    pub fn prepare(&self, graph: &Graph) -> Result<(), CodecError> {
        self.inner.lock().prepare(graph)
    }

    pub fn finish_prepare(&self) {
        self.inner.lock().finish_prepare();
    }

    pub fn encode(&self, graph: &Graph) -> Result<usize, CodecError> {
        self.inner.lock().encode(graph)
    }

    /// Run `f` with the encoder locked.
    pub fn with<R>(&self, f: impl FnOnce(&GraphEncoder) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn into_inner(self) -> GraphEncoder {
        self.inner.into_inner()
    }
}
