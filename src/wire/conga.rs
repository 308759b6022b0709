//! Tag riding on CONGA DATA packets: the chosen path, the running congestion
//! extent, and one piggybacked feedback sample.

use std::io::prelude::*;
use std::io::Cursor;

use super::{put_u32, read_u32, AsRawTag, HDR_LENGTH};
use crate::errors::Result;

pub(crate) const KIND: u8 = 4;

/// Sentinel in `fb_path`/`fb_metric` meaning "no feedback piggybacked".
pub const CONGA_NULL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub path: u32,
    /// Maximum quantized congestion extent seen along the path so far.
    pub ce: u32,
    pub hop: u32,
    pub fb_path: u32,
    pub fb_metric: u32,
}

impl Tag {
    /// The piggybacked feedback, unless it is the sentinel.
    pub fn feedback(&self) -> Option<(u32, u32)> {
        if self.fb_path != CONGA_NULL && self.fb_metric != CONGA_NULL {
            Some((self.fb_path, self.fb_metric))
        } else {
            None
        }
    }
}

impl AsRawTag for Tag {
    fn get_hdr(&self) -> (u8, u32) {
        (KIND, HDR_LENGTH + 5 * 4)
    }

    fn put_body<W: Write>(&self, w: &mut W) -> Result<()> {
        put_u32(w, self.path)?;
        put_u32(w, self.ce)?;
        put_u32(w, self.hop)?;
        put_u32(w, self.fb_path)?;
        put_u32(w, self.fb_metric)?;
        Ok(())
    }

    fn from_body(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Tag {
            path: read_u32(c)?,
            ce: read_u32(c)?,
            hop: read_u32(c)?,
            fb_path: read_u32(c)?,
            fb_metric: read_u32(c)?,
        })
    }
}
