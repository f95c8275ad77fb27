//! Node identifiers.

use super::{ByteString, Guid};
use std::fmt;

/// The identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u32),
    String(Option<String>),
    Guid(Guid),
    Opaque(ByteString),
}

/// A namespace-qualified node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace_index: u16,
    pub identifier: Identifier,
}

impl NodeId {
    pub const NULL: NodeId = NodeId {
        namespace_index: 0,
        identifier: Identifier::Numeric(0),
    };

    pub fn numeric(namespace_index: u16, id: u32) -> Self {
        NodeId {
            namespace_index,
            identifier: Identifier::Numeric(id),
        }
    }

    pub fn string(namespace_index: u16, id: &str) -> Self {
        NodeId {
            namespace_index,
            identifier: Identifier::String(Some(id.to_string())),
        }
    }

    pub fn guid(namespace_index: u16, id: Guid) -> Self {
        NodeId {
            namespace_index,
            identifier: Identifier::Guid(id),
        }
    }

    pub fn opaque(namespace_index: u16, id: impl Into<ByteString>) -> Self {
        NodeId {
            namespace_index,
            identifier: Identifier::Opaque(id.into()),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == NodeId::NULL
    }

    /// The numeric id in namespace 0, if that is what this is.
    pub fn as_ns0_numeric(&self) -> Option<u32> {
        match (self.namespace_index, &self.identifier) {
            (0, Identifier::Numeric(id)) => Some(*id),
            _ => None,
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::NULL
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index != 0 {
            write!(f, "ns={};", self.namespace_index)?;
        }
        match &self.identifier {
            Identifier::Numeric(id) => write!(f, "i={id}"),
            Identifier::String(s) => write!(f, "s={}", s.as_deref().unwrap_or("")),
            Identifier::Guid(g) => write!(f, "g={g}"),
            Identifier::Opaque(b) => write!(f, "b=<{} bytes>", b.len()),
        }
    }
}

/// A node identifier that may reference another server or namespace by URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ExpandedNodeId {
    pub node_id: NodeId,
    pub namespace_uri: Option<String>,
    pub server_index: u32,
}

impl ExpandedNodeId {
    pub fn local(node_id: NodeId) -> Self {
        ExpandedNodeId {
            node_id,
            namespace_uri: None,
            server_index: 0,
        }
    }
}

impl From<NodeId> for ExpandedNodeId {
    fn from(node_id: NodeId) -> Self {
        ExpandedNodeId::local(node_id)
    }
}
