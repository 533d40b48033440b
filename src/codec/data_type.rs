//! Data-type tags for codec ports.
//!
//! Every encoder and decoder side of a node declares the payload shape it
//! accepts and produces. The registry checks adjacent nodes against each
//! other when a configuration is attached.

use std::borrow::Cow;

/// What a tag describes.
///
/// Two tags with the same name but a different role are distinct, so the
/// `void` encoder tag never matches the `void` decoder tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRole {
    /// A plain data payload (buffer, string, ...)
    Data,
    /// An encoder interface offered to children
    Encoder,
    /// A decoder interface offered to parents
    Decoder,
}

/// A nominal payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Compatible only with itself
    Primitive {
        role: TypeRole,
        name: Cow<'static, str>,
    },
    /// Compatible with any of its members
    Composite { members: Vec<DataType> },
}

impl DataType {
    pub const fn data(name: &'static str) -> Self {
        DataType::Primitive {
            role: TypeRole::Data,
            name: Cow::Borrowed(name),
        }
    }

    pub const fn encoder(name: &'static str) -> Self {
        DataType::Primitive {
            role: TypeRole::Encoder,
            name: Cow::Borrowed(name),
        }
    }

    pub const fn decoder(name: &'static str) -> Self {
        DataType::Primitive {
            role: TypeRole::Decoder,
            name: Cow::Borrowed(name),
        }
    }

    /// Tag with a name only known at runtime
    pub fn named(role: TypeRole, name: impl Into<String>) -> Self {
        DataType::Primitive {
            role,
            name: Cow::Owned(name.into()),
        }
    }

    /// Union of primitive tags
    pub fn composite(members: impl IntoIterator<Item = DataType>) -> Self {
        DataType::Composite {
            members: members.into_iter().collect(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            DataType::Primitive { name, .. } => name.to_string(),
            DataType::Composite { members } => members
                .iter()
                .map(DataType::name)
                .collect::<Vec<_>>()
                .join("|"),
        }
    }

    /// Whether a value of type `other` can be handed to a port of this type
    pub fn is_compatible(&self, other: &DataType) -> bool {
        match self {
            DataType::Primitive { .. } => self == other,
            DataType::Composite { members } => members.iter().any(|m| m == other),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Raw bytes
pub const BUFFER: DataType = DataType::data("buffer");
/// Typed byte array
pub const BINARY: DataType = DataType::data("uint8array");
/// Text
pub const STRING: DataType = DataType::data("string");
/// Encoder side of a leaf that sends nothing
pub const NOOP_ENCODER: DataType = DataType::encoder("void");
/// Decoder side of a root that receives nothing
pub const NOOP_DECODER: DataType = DataType::decoder("void");
/// Encoder interface offered by the USB2ANY codec to its children
pub const U2A_PACKET_ENCODER: DataType = DataType::encoder("u2aPacket");

/// `string|buffer`
pub fn buffer_or_string() -> DataType {
    DataType::composite([STRING, BUFFER])
}

/// `uint8array|buffer`
pub fn binary_or_buffer() -> DataType {
    DataType::composite([BINARY, BUFFER])
}

/// Resolve a tag from the name used in settings files.
///
/// Composite names (`a|b`) resolve member by member. Names that are not one
/// of the well known data tags become encoder or decoder interface tags for
/// the given role.
pub fn parse_type_name(name: &str, role: TypeRole) -> DataType {
    let name = name.trim();
    if name.contains('|') {
        return DataType::composite(name.split('|').map(|part| parse_type_name(part, role)));
    }
    match name {
        "buffer" => BUFFER,
        "uint8array" => BINARY,
        "string" => STRING,
        "void" => match role {
            TypeRole::Decoder => NOOP_DECODER,
            _ => NOOP_ENCODER,
        },
        other => DataType::named(role, other),
    }
}
