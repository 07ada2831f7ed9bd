use std::sync::Arc;

use deferc_ir::{
    ArithOp, CallKind, Constant, DeoptReason, FrameStateData, Graph, InvokeData, Node, NodeId,
    NodeKind,
};

use crate::encoder::{EncodedArtifact, NULL_ORDER_ID, tag};
use crate::error::CodecError;
use crate::replace::{IdentityReplacer, ObjectReplacer};
use crate::stream::TypeReader;
use crate::table::ObjectTable;

/// Rebuilds graphs from an encoded buffer and its object table.
pub struct GraphDecoder<'a> {
    encoding: &'a [u8],
    objects: &'a ObjectTable,
    replacer: Arc<dyn ObjectReplacer>,
}

impl<'a> GraphDecoder<'a> {
    pub fn new(encoding: &'a [u8], objects: &'a ObjectTable, replacer: Arc<dyn ObjectReplacer>) -> Self {
        Self {
            encoding,
            objects,
            replacer,
        }
    }

    pub fn for_artifact(artifact: &'a EncodedArtifact) -> Self {
        Self::new(&artifact.encoding, &artifact.objects, Arc::new(IdentityReplacer))
    }

    /// Decode the graph whose encoding starts at `offset`.
    pub fn decode(&self, offset: usize) -> Result<Graph, CodecError> {
        let mut reader = TypeReader::new(self.encoding, offset);
        let method = self.objects.method(reader.get_uv_u32()?)?;
        let count = reader.get_uv()? as usize;
        let width = reader.get_u8()?;
        if !matches!(width, 1 | 2 | 4) {
            return Err(CodecError::BadWidth(width));
        }
        let inlined_count = reader.get_uv()? as usize;
        let mut inlined = Vec::with_capacity(inlined_count.min(1024));
        for _ in 0..inlined_count {
            inlined.push(self.objects.method(reader.get_uv_u32()?)?);
        }

        let mut nodes = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            nodes.push(self.read_node(&mut reader, count, width)?);
        }
        if !matches!(nodes.first().map(|node| &node.kind), Some(NodeKind::Start)) {
            return Err(CodecError::MissingStart(offset));
        }
        Ok(Graph::from_nodes(method, nodes, inlined))
    }

    fn read_node(&self, reader: &mut TypeReader<'_>, count: usize, width: u8) -> Result<Node, CodecError> {
        let offset = reader.position();
        let node_tag = reader.get_u8()?;
        let kind = match node_tag {
            tag::START => NodeKind::Start,
            tag::PARAMETER => NodeKind::Parameter {
                index: reader.get_uv_u32()?,
            },
            tag::CONSTANT => NodeKind::Constant(self.read_constant(reader)?),
            tag::ARITHMETIC => {
                let raw = reader.get_u8()?;
                let op = ArithOp::from_u8(raw).ok_or(CodecError::UnknownTag {
                    what: "arithmetic",
                    tag: raw,
                    offset,
                })?;
                NodeKind::Arithmetic { op }
            }
            tag::IS_NULL => NodeKind::IsNull,
            tag::INVOKE => NodeKind::Invoke(self.read_invoke(reader)?),
            tag::INVOKE_WITH_EXCEPTION => NodeKind::InvokeWithException(self.read_invoke(reader)?),
            tag::EXCEPTION_OBJECT => NodeKind::ExceptionObject,
            tag::FIXED_GUARD => {
                let reason = read_reason(reader)?;
                let negated = reader.get_u8()? != 0;
                NodeKind::FixedGuard { reason, negated }
            }
            tag::DEOPTIMIZE => NodeKind::Deoptimize {
                reason: read_reason(reader)?,
            },
            tag::STACK_VALUE => NodeKind::StackValue {
                size: reader.get_uv_u32()?,
            },
            tag::DEOPT_ENTRY => NodeKind::DeoptEntry,
            tag::DEOPT_PROXY_ANCHOR => NodeKind::DeoptProxyAnchor,
            tag::FRAME_STATE => {
                let method = self.objects.method(reader.get_uv_u32()?)?;
                let bci = reader.get_sv_i32()?;
                let flags = reader.get_u8()?;
                NodeKind::FrameState(FrameStateData {
                    method,
                    bci,
                    during_call: flags & tag::STATE_DURING_CALL != 0,
                    rethrow: flags & tag::STATE_RETHROW != 0,
                })
            }
            tag::RETURN => NodeKind::Return,
            tag::UNWIND => NodeKind::Unwind,
            other => {
                return Err(CodecError::UnknownTag {
                    what: "node",
                    tag: other,
                    offset,
                });
            }
        };

        let inputs = read_edges(reader, count, width)?;
        let successors = read_edges(reader, count, width)?;
        let state = read_order_id(reader, count, width, true)?;
        Ok(Node {
            kind,
            inputs,
            successors,
            state,
        })
    }

    fn read_constant(&self, reader: &mut TypeReader<'_>) -> Result<Constant, CodecError> {
        let offset = reader.position();
        Ok(match reader.get_u8()? {
            tag::CONST_NULL => Constant::Null,
            tag::CONST_INT => Constant::Int(reader.get_sv()?),
            tag::CONST_FLOAT => Constant::Float(reader.get_uv()?),
            tag::CONST_OBJECT => {
                let runtime = self.objects.object(reader.get_uv_u32()?)?;
                Constant::Object(self.replacer.to_hosted(&runtime))
            }
            other => {
                return Err(CodecError::UnknownTag {
                    what: "constant",
                    tag: other,
                    offset,
                });
            }
        })
    }

    fn read_invoke(&self, reader: &mut TypeReader<'_>) -> Result<InvokeData, CodecError> {
        let target = self.objects.method(reader.get_uv_u32()?)?;
        let declared = self.objects.method(reader.get_uv_u32()?)?;
        let offset = reader.position();
        let kind = match reader.get_u8()? {
            tag::CALL_STATIC => CallKind::Static,
            tag::CALL_VIRTUAL => CallKind::Virtual,
            other => {
                return Err(CodecError::UnknownTag {
                    what: "call kind",
                    tag: other,
                    offset,
                });
            }
        };
        let bci = reader.get_sv_i32()?;
        let has_receiver = reader.get_u8()? != 0;
        Ok(InvokeData {
            target,
            declared,
            kind,
            bci,
            has_receiver,
        })
    }
}

fn read_reason(reader: &mut TypeReader<'_>) -> Result<DeoptReason, CodecError> {
    let offset = reader.position();
    let raw = reader.get_u8()?;
    DeoptReason::from_u8(raw).ok_or(CodecError::UnknownTag {
        what: "deopt reason",
        tag: raw,
        offset,
    })
}

fn read_edges(reader: &mut TypeReader<'_>, count: usize, width: u8) -> Result<Vec<NodeId>, CodecError> {
    let len = reader.get_uv()? as usize;
    let mut edges = Vec::with_capacity(len.min(count));
    for _ in 0..len {
        let offset = reader.position();
        let edge = read_order_id(reader, count, width, false)?;
        edges.push(edge.ok_or(CodecError::BadOrderId {
            id: NULL_ORDER_ID,
            offset,
        })?);
    }
    Ok(edges)
}

fn read_order_id(
    reader: &mut TypeReader<'_>,
    count: usize,
    width: u8,
    nullable: bool,
) -> Result<Option<NodeId>, CodecError> {
    let offset = reader.position();
    let id = match width {
        1 => u32::from(reader.get_u8()?),
        2 => u32::from(reader.get_u16()?),
        _ => reader.get_u32()?,
    };
    if id == NULL_ORDER_ID {
        return if nullable {
            Ok(None)
        } else {
            Err(CodecError::BadOrderId { id, offset })
        };
    }
    if id as usize > count {
        return Err(CodecError::BadOrderId { id, offset });
    }
    Ok(Some(NodeId(id - 1)))
}
