// Content identifiers.
//
// A Name is a fixed 256-bit value that identifies an immutable object
// and carries enough metadata to work with the object before fetching
// it. For content-addressed kinds the leading bytes are a truncated
// SHA-256 digest of the object's canonical encoding, followed by a
// 56-bit size field and one kind byte. Literal names carry their whole
// payload inline and never touch the store.
//
// Names are plain values. They are freely copyable, compare by full
// bit equality, and hash uniformly. Two content-addressed Names being
// equal implies the objects behind them are equal.

use std::fmt;

use enumflags2::BitFlags;


pub const NAME_LEN: usize = 32;

// Bytes of SHA-256 output kept in a content-addressed Name.
pub const DIGEST_LEN: usize = 24;

// Largest payload a Literal can carry inline.
pub const LITERAL_MAX: usize = 30;

const SIZE_OFFSET: usize = 24;
const LEN_BYTE: usize = 30;
const KIND_BYTE: usize = 31;


// The kind of object a Name refers to. Discriminants are single bits
// so that sets of kinds can be reported in errors.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Kind {
    Blob    = 0b00001,
    Tree    = 0b00010,
    Thunk   = 0b00100,
    Tag     = 0b01000,
    Literal = 0b10000,
}


pub type KindSet = BitFlags<Kind>;


impl Kind {
    pub fn from_bits(bits: u8) -> Option<Kind> {
        match bits {
            0b00001 => Some(Kind::Blob),
            0b00010 => Some(Kind::Tree),
            0b00100 => Some(Kind::Thunk),
            0b01000 => Some(Kind::Tag),
            0b10000 => Some(Kind::Literal),
            _ => None
        }
    }
}


#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Name([u8; NAME_LEN]);


impl Name {
    // Build a content-addressed Name from a full SHA-256 digest. The
    // digest is truncated to DIGEST_LEN bytes and the size is clamped
    // to the 56-bit size field.
    pub(crate) fn from_digest(kind: Kind, digest: &[u8], size: u64) -> Name {
        let mut bytes = [0u8; NAME_LEN];
        bytes[..DIGEST_LEN].copy_from_slice(&digest[..DIGEST_LEN]);
        bytes[SIZE_OFFSET..KIND_BYTE]
            .copy_from_slice(&size.to_le_bytes()[..KIND_BYTE - SIZE_OFFSET]);
        bytes[KIND_BYTE] = kind as u8;
        Name(bytes)
    }

    // A Name whose payload lives in the Name itself. Returns None when
    // the payload doesn't fit.
    pub fn literal(payload: &[u8]) -> Option<Name> {
        if payload.len() > LITERAL_MAX {
            return None;
        }
        let mut bytes = [0u8; NAME_LEN];
        bytes[..payload.len()].copy_from_slice(payload);
        bytes[LEN_BYTE] = payload.len() as u8;
        bytes[KIND_BYTE] = Kind::Literal as u8;
        Some(Name(bytes))
    }

    // Inline a little-endian 32-bit integer.
    pub fn literal_u32(value: u32) -> Name {
        let bytes = value.to_le_bytes();
        let mut name = [0u8; NAME_LEN];
        name[..4].copy_from_slice(&bytes);
        name[LEN_BYTE] = 4;
        name[KIND_BYTE] = Kind::Literal as u8;
        Name(name)
    }

    pub fn kind(&self) -> Kind {
        Kind::from_bits(self.0[KIND_BYTE]).expect("name carries a valid kind byte")
    }

    // Object size: byte length for Blobs and Literals, entry count for
    // Trees, wrapped-tree entry count for Thunks and Tags.
    pub fn size(&self) -> u64 {
        if self.kind() == Kind::Literal {
            return self.0[LEN_BYTE] as u64;
        }
        let mut size = [0u8; 8];
        size[..KIND_BYTE - SIZE_OFFSET].copy_from_slice(&self.0[SIZE_OFFSET..KIND_BYTE]);
        u64::from_le_bytes(size)
    }

    // The inline payload of a Literal.
    pub fn payload(&self) -> Option<&[u8]> {
        if self.kind() == Kind::Literal {
            Some(&self.0[..self.0[LEN_BYTE] as usize])
        } else {
            None
        }
    }

    // The same digest and size under a different kind. Meaningless for
    // Literals, whose identity is their payload.
    pub(crate) fn retag(&self, kind: Kind) -> Name {
        let mut bytes = self.0;
        bytes[KIND_BYTE] = kind as u8;
        Name(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }
}


impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            Kind::Literal => write!(
                f,
                "Literal({})",
                hex::encode(&self.0[..self.0[LEN_BYTE] as usize])
            ),
            kind => write!(
                f,
                "{:?}({}, {})",
                kind,
                hex::encode(&self.0[..8]),
                self.size()
            )
        }
    }
}
