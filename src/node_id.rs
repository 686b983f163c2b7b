//! OPC UA node-id string encoding (spec.md §6).
//!
//! Syntax: `ns=<N>;{i|s|g|b}=<V>`, namespace `0` omitted from output.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u32),
    String(String),
    Guid(String),
    Opaque(String),
}

impl Identifier {
    fn prefix(&self) -> char {
        match self {
            Identifier::Numeric(_) => 'i',
            Identifier::String(_) => 's',
            Identifier::Guid(_) => 'g',
            Identifier::Opaque(_) => 'b',
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(v) => write!(f, "{}={}", self.prefix(), v),
            Identifier::String(v) => write!(f, "{}={}", self.prefix(), v),
            Identifier::Guid(v) => write!(f, "{}={}", self.prefix(), v),
            Identifier::Opaque(v) => write!(f, "{}={}", self.prefix(), v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeId {
    pub fn new(namespace: u16, identifier: Identifier) -> Self {
        Self {
            namespace,
            identifier,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};{}", self.namespace, self.identifier)
        } else {
            write!(f, "{}", self.identifier)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeIdParseError {
    #[error("missing identifier component in node-id string: {0}")]
    MissingIdentifier(String),
    #[error("unknown identifier prefix {0:?} in node-id string")]
    UnknownPrefix(char),
    #[error("invalid numeric identifier: {0}")]
    InvalidNumeric(String),
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut namespace: u16 = 0;
        let mut ident_part: Option<&str> = None;

        for segment in s.split(';') {
            if let Some(rest) = segment.strip_prefix("ns=") {
                namespace = rest.parse().unwrap_or(0);
            } else {
                ident_part = Some(segment);
            }
        }

        let ident_part =
            ident_part.ok_or_else(|| NodeIdParseError::MissingIdentifier(s.to_string()))?;
        let mut parts = ident_part.splitn(2, '=');
        let prefix = parts
            .next()
            .and_then(|p| p.chars().next())
            .ok_or_else(|| NodeIdParseError::MissingIdentifier(s.to_string()))?;
        let value = parts.next().unwrap_or("");

        let identifier = match prefix {
            'i' => Identifier::Numeric(
                value
                    .parse()
                    .map_err(|_| NodeIdParseError::InvalidNumeric(value.to_string()))?,
            ),
            's' => Identifier::String(value.to_string()),
            'g' => Identifier::Guid(value.to_string()),
            'b' => Identifier::Opaque(value.to_string()),
            other => return Err(NodeIdParseError::UnknownPrefix(other)),
        };

        Ok(NodeId {
            namespace,
            identifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numeric_with_namespace() {
        let n = NodeId::new(2, Identifier::Numeric(42));
        assert_eq!(n.to_string(), "ns=2;i=42");
    }

    #[test]
    fn omits_namespace_zero() {
        let n = NodeId::new(0, Identifier::String("Temp".to_string()));
        assert_eq!(n.to_string(), "s=Temp");
    }

    #[test]
    fn parses_round_trip() {
        let original = "ns=2;s=Temp";
        let parsed: NodeId = original.parse().unwrap();
        assert_eq!(parsed.to_string(), original);
    }

    #[test]
    fn parses_guid_and_opaque() {
        let g: NodeId = "ns=3;g=abcd-ef".parse().unwrap();
        assert_eq!(g.identifier, Identifier::Guid("abcd-ef".to_string()));
        let b: NodeId = "ns=4;b=SGVsbG8=".parse().unwrap();
        assert_eq!(b.identifier, Identifier::Opaque("SGVsbG8=".to_string()));
    }
}
