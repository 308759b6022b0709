//! Tag riding on CONWEAVE DATA packets.

use std::io::prelude::*;
use std::io::Cursor;

use super::{put_u32, put_u64, read_u32, read_u64, AsRawTag, HDR_LENGTH};
use crate::errors::{Error, Result};

pub(crate) const KIND: u8 = 1;

/// Control role of a DATA packet within its epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    /// Ordinary payload.
    Data = 1,
    /// RTT request; the destination ToR must REPLY with flag INIT.
    Init = 2,
    /// Last phase-0 packet of the epoch; the destination ToR must REPLY
    /// with flag TAIL.
    Tail = 3,
}

impl Flag {
    fn from_u32(x: u32) -> Result<Flag> {
        match x {
            1 => Ok(Flag::Data),
            2 => Ok(Flag::Init),
            3 => Ok(Flag::Tail),
            _ => Err(Error(format!("unknown data tag flag {}", x))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub path: u32,
    pub hop: u32,
    pub epoch: u32,
    pub phase: u32,
    /// Departure time at the source ToR, nanoseconds.
    pub tx_time: u64,
    /// Departure time of the last phase-0 packet of this epoch, or 0.
    pub tail_time: u64,
    pub flag: Flag,
}

impl AsRawTag for Tag {
    fn get_hdr(&self) -> (u8, u32) {
        (KIND, HDR_LENGTH + 5 * 4 + 2 * 8)
    }

    fn put_body<W: Write>(&self, w: &mut W) -> Result<()> {
        put_u32(w, self.path)?;
        put_u32(w, self.hop)?;
        put_u32(w, self.epoch)?;
        put_u32(w, self.phase)?;
        put_u64(w, self.tx_time)?;
        put_u64(w, self.tail_time)?;
        put_u32(w, self.flag as u32)?;
        Ok(())
    }

    fn from_body(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Tag {
            path: read_u32(c)?,
            hop: read_u32(c)?,
            epoch: read_u32(c)?,
            phase: read_u32(c)?,
            tx_time: read_u64(c)?,
            tail_time: read_u64(c)?,
            flag: Flag::from_u32(read_u32(c)?)?,
        })
    }
}
