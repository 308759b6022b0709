//! Tag riding on ACK-shaped CONWEAVE REPLY packets.

use std::io::prelude::*;
use std::io::Cursor;

use super::{put_u32, read_u32, AsRawTag, HDR_LENGTH};
use crate::errors::{Error, Result};

pub(crate) const KIND: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    /// Answers an RTT request.
    Init = 1,
    /// Confirms flowcut closure (CLEAR).
    Tail = 2,
}

impl Flag {
    fn from_u32(x: u32) -> Result<Flag> {
        match x {
            1 => Ok(Flag::Init),
            2 => Ok(Flag::Tail),
            _ => Err(Error(format!("unknown reply tag flag {}", x))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub flag: Flag,
    pub epoch: u32,
    pub phase: u32,
}

impl AsRawTag for Tag {
    fn get_hdr(&self) -> (u8, u32) {
        (KIND, HDR_LENGTH + 3 * 4)
    }

    fn put_body<W: Write>(&self, w: &mut W) -> Result<()> {
        put_u32(w, self.flag as u32)?;
        put_u32(w, self.epoch)?;
        put_u32(w, self.phase)?;
        Ok(())
    }

    fn from_body(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Tag {
            flag: Flag::from_u32(read_u32(c)?)?,
            epoch: read_u32(c)?,
            phase: read_u32(c)?,
        })
    }
}
