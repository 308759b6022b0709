//! Tag riding on CONWEAVE NOTIFY packets: one congested path id.

use std::io::prelude::*;
use std::io::Cursor;

use super::{put_u32, read_u32, AsRawTag, HDR_LENGTH};
use crate::errors::Result;

pub(crate) const KIND: u8 = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    /// Path of the DATA packet that arrived ECN-marked.
    pub path: u32,
}

impl AsRawTag for Tag {
    fn get_hdr(&self) -> (u8, u32) {
        (KIND, HDR_LENGTH + 4)
    }

    fn put_body<W: Write>(&self, w: &mut W) -> Result<()> {
        put_u32(w, self.path)
    }

    fn from_body(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Tag { path: read_u32(c)? })
    }
}
