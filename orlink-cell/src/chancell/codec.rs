//! Implementation for encoding and decoding of raw cells.

use super::{AnyCell, Cell, ChanCmd, CircId, VarCell, CELL_DATA_LEN};
use crate::{Error, Result};
use arrayref::array_ref;
use orlink_bytes::Writer;

use bytes::BytesMut;

/// This object can be used to encode and decode channel cells.
///
/// The implemented formats are:
///
/// ```ignore
///     u16 | u32 circid;
///     u8 command;
///     u16 len;
///     u8 body[len];
/// ```
///
/// ```ignore
///     u16 | u32 circid;
///     u8 command;
///     u8 body[509];
/// ```
///
/// Circuit IDs are two bytes wide on link protocols before 4, and
/// four bytes wide from link protocol 4 on.  VERSIONS cells always
/// use the two-byte form when encoded, since they are exchanged
/// before any version has been negotiated; a codec constructed with a
/// link protocol of 0 can be used to frame them on the decode side.
pub struct ChannelCodec {
    /// The link protocol version being used for this channel.
    link_proto: u16,
}

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version.
    pub fn new(link_proto: u16) -> Self {
        ChannelCodec { link_proto }
    }

    /// Return the number of bytes used to encode a circuit ID.
    fn circid_len(&self) -> usize {
        if self.link_proto >= 4 {
            4
        } else {
            2
        }
    }

    /// Write the circuit ID of a cell, using the width `n`.
    fn write_circid(dst: &mut BytesMut, circid: CircId, n: usize) {
        if n == 4 {
            dst.write_u32(circid.into());
        } else {
            dst.write_u16(u32::from(circid) as u16);
        }
    }

    /// Write the given fixed-length cell into the provided BytesMut
    /// object.
    pub fn write_cell(&mut self, cell: Cell, dst: &mut BytesMut) {
        Self::write_circid(dst, cell.circid(), self.circid_len());
        dst.write_u8(cell.cmd().into());
        dst.write_all(&cell.payload()[..]);
    }

    /// Write the given variable-length cell into the provided BytesMut
    /// object.
    ///
    /// Returns an error if the payload is too long to represent.
    pub fn write_var_cell(&mut self, cell: VarCell, dst: &mut BytesMut) -> Result<()> {
        let idlen = if cell.cmd() == ChanCmd::VERSIONS {
            2
        } else {
            self.circid_len()
        };
        if cell.payload().len() > u16::MAX as usize {
            return Err(Error::CantEncode);
        }
        Self::write_circid(dst, cell.circid(), idlen);
        dst.write_u8(cell.cmd().into());
        dst.write_u16(cell.payload().len() as u16);
        dst.write_all(cell.payload());
        Ok(())
    }

    /// Try to decode a cell from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a cell that
    /// might just be truncated, return Ok(None).
    pub fn decode_cell(&mut self, src: &mut BytesMut) -> Result<Option<AnyCell>> {
        let idlen = self.circid_len();
        // Smallest possible cell: varcell with a zero-length body.
        if src.len() < idlen + 3 {
            return Ok(None);
        }
        let cmd: ChanCmd = src[idlen].into();
        let varcell = cmd.is_var_cell();
        let cell_len: usize = if varcell {
            let msg_len = u16::from_be_bytes(*array_ref![&src[idlen + 1..idlen + 3], 0, 2]);
            msg_len as usize + idlen + 3
        } else {
            idlen + 1 + CELL_DATA_LEN
        };
        if src.len() < cell_len {
            return Ok(None);
        }

        let cell = src.split_to(cell_len);
        let circid: CircId = if idlen == 4 {
            u32::from_be_bytes(*array_ref![&cell[0..4], 0, 4]).into()
        } else {
            u32::from(u16::from_be_bytes(*array_ref![&cell[0..2], 0, 2])).into()
        };
        if !cmd.accepts_circid_val(circid) {
            return Err(Error::ChanProto(format!(
                "Invalid circuit ID {} for cell command {}",
                circid, cmd
            )));
        }

        let body = &cell[idlen + 1 + if varcell { 2 } else { 0 }..];
        let decoded = if varcell {
            AnyCell::Var(VarCell::new(circid, cmd, body))
        } else {
            let mut payload = Box::new([0_u8; CELL_DATA_LEN]);
            payload.copy_from_slice(body);
            AnyCell::Fixed(Cell::from_payload(circid, cmd, payload))
        };
        Ok(Some(decoded))
    }
}
