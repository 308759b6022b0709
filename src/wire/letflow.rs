//! Tag riding on LETFLOW DATA packets: just the path and the hop index.

use std::io::prelude::*;
use std::io::Cursor;

use super::{put_u32, read_u32, AsRawTag, HDR_LENGTH};
use crate::errors::Result;

pub(crate) const KIND: u8 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub path: u32,
    pub hop: u32,
}

impl AsRawTag for Tag {
    fn get_hdr(&self) -> (u8, u32) {
        (KIND, HDR_LENGTH + 2 * 4)
    }

    fn put_body<W: Write>(&self, w: &mut W) -> Result<()> {
        put_u32(w, self.path)?;
        put_u32(w, self.hop)?;
        Ok(())
    }

    fn from_body(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Tag {
            path: read_u32(c)?,
            hop: read_u32(c)?,
        })
    }
}
