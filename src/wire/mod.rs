//! Binary codecs for the per-packet load-balancing tags.
//!
//! Each engine has its own well-typed tag struct in its own module; `Tag` is
//! the sum of all of them, and is what a `Packet` carries. On the wire a tag
//! is a one-byte kind followed by a fixed-width little-endian body.

use std::io::prelude::*;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Error, Result};

pub mod conga;
pub mod data;
pub mod letflow;
pub mod notify;
pub mod reply;

pub(crate) const HDR_LENGTH: u32 = 1;

/// Serialization behavior for a tag body. The kind byte and framing are
/// handled by `serialize`/`Tag::from_buf`.
pub trait AsRawTag {
    /// (kind, total length in bytes including the kind byte)
    fn get_hdr(&self) -> (u8, u32);
    fn put_body<W: Write>(&self, w: &mut W) -> Result<()>;
    fn from_body(body: &mut Cursor<&[u8]>) -> Result<Self>
    where
        Self: std::marker::Sized;
}

/// Serialize any tag to its wire form.
pub fn serialize<T: AsRawTag>(t: &T) -> Result<Vec<u8>> {
    let (kind, len) = t.get_hdr();
    let mut buf = Vec::with_capacity(len as usize);
    buf.write_u8(kind)?;
    t.put_body(&mut buf)?;
    Ok(buf)
}

/// The tag attached to a packet, one kind per engine family.
#[derive(Clone, Debug, PartialEq)]
pub enum Tag {
    Data(data::Tag),
    Reply(reply::Tag),
    Notify(notify::Tag),
    Conga(conga::Tag),
    Letflow(letflow::Tag),
}

impl Tag {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Tag::Data(t) => serialize(t),
            Tag::Reply(t) => serialize(t),
            Tag::Notify(t) => serialize(t),
            Tag::Conga(t) => serialize(t),
            Tag::Letflow(t) => serialize(t),
        }
    }

    pub fn from_buf(buf: &[u8]) -> Result<Tag> {
        let mut c = Cursor::new(buf);
        let kind = c.read_u8()?;
        match kind {
            data::KIND => Ok(Tag::Data(data::Tag::from_body(&mut c)?)),
            reply::KIND => Ok(Tag::Reply(reply::Tag::from_body(&mut c)?)),
            notify::KIND => Ok(Tag::Notify(notify::Tag::from_body(&mut c)?)),
            conga::KIND => Ok(Tag::Conga(conga::Tag::from_body(&mut c)?)),
            letflow::KIND => Ok(Tag::Letflow(letflow::Tag::from_body(&mut c)?)),
            _ => Err(Error(format!("unknown tag kind {}", kind))),
        }
    }
}

pub(crate) fn read_u32(c: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(c.read_u32::<LittleEndian>()?)
}

pub(crate) fn read_u64(c: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(c.read_u64::<LittleEndian>()?)
}

pub(crate) fn put_u32<W: Write>(w: &mut W, x: u32) -> Result<()> {
    w.write_u32::<LittleEndian>(x)?;
    Ok(())
}

pub(crate) fn put_u64<W: Write>(w: &mut W, x: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(x)?;
    Ok(())
}
