//! Serializes the `LockingAndX` oplock break request forwarded verbatim
//! to the owning client by the dispatcher.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::state::oplock::OplockLevel;

/// SMB_COM_LOCKING_ANDX command code.
pub const COM_LOCKING_ANDX: u8 = 0x24;

/// TypeOfLock bit: this packet revokes an oplock.
pub const LOCK_TYPE_BREAK: u8 = 0x02;

/// TypeOfLock bit: shared (read) semantics retained after the break.
pub const LOCK_TYPE_SHARED: u8 = 0x01;

/// NewOplockLevel values.
pub const NEW_LEVEL_NONE: u8 = 0x00;
pub const NEW_LEVEL_II: u8 = 0x01;

/// Multiplex id marking an unsolicited server-initiated packet.
const MID_NOTIFICATION: u16 = 0xFFFF;

const SMB_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// Serializes an oplock break request into `dest`.
///
/// # Parameters
///
/// * `tree_id` --- tree connect of the owning handle.
/// * `file_id` --- FID of the owning handle (truncated to the wire width).
/// * `new_level` --- level the owner must lower to; only `Level2` keeps
///   any caching, every other value means the oplock is fully revoked.
///
/// The break-in-progress timer begins when the dispatcher reports this
/// packet written, not when it is built.
pub fn write_break_request(
    dest: &mut dyn Write,
    tree_id: u32,
    file_id: u32,
    new_level: OplockLevel,
) -> io::Result<()> {
    let level2 = new_level == OplockLevel::Level2;

    // Header.
    dest.write_all(&SMB_MAGIC)?;
    dest.write_u8(COM_LOCKING_ANDX)?;
    dest.write_u32::<LittleEndian>(0)?; // status
    dest.write_u8(0)?; // flags: server-initiated request
    dest.write_u16::<LittleEndian>(0)?; // flags2
    dest.write_u16::<LittleEndian>(0)?; // pid high
    dest.write_all(&[0u8; 8])?; // signature
    dest.write_u16::<LittleEndian>(0)?; // reserved
    dest.write_u16::<LittleEndian>(tree_id as u16)?;
    dest.write_u16::<LittleEndian>(0)?; // pid
    dest.write_u16::<LittleEndian>(0)?; // uid
    dest.write_u16::<LittleEndian>(MID_NOTIFICATION)?;

    // LockingAndX parameter block, word count 8.
    dest.write_u8(8)?;
    dest.write_u8(0xFF)?; // no chained AndX command
    dest.write_u8(0)?; // AndX reserved
    dest.write_u16::<LittleEndian>(0)?; // AndX offset
    dest.write_u16::<LittleEndian>(file_id as u16)?;
    let lock_type = LOCK_TYPE_BREAK | if level2 { LOCK_TYPE_SHARED } else { 0 };
    dest.write_u8(lock_type)?;
    dest.write_u8(if level2 { NEW_LEVEL_II } else { NEW_LEVEL_NONE })?;
    dest.write_u32::<LittleEndian>(0)?; // timeout
    dest.write_u16::<LittleEndian>(0)?; // unlock ranges
    dest.write_u16::<LittleEndian>(0)?; // lock ranges

    // Empty data block.
    dest.write_u16::<LittleEndian>(0)?;

    Ok(())
}

/// Builds the break request as an owned packet.
pub fn break_request(tree_id: u32, file_id: u32, new_level: OplockLevel) -> Vec<u8> {
    let mut packet = Vec::with_capacity(64);
    write_break_request(&mut packet, tree_id, file_id, new_level)
        .expect("writing to a vector cannot fail");
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_to_none_sets_break_bit_only() {
        let packet = break_request(3, 0x4001, OplockLevel::None);
        assert_eq!(&packet[..4], &SMB_MAGIC);
        assert_eq!(packet[4], COM_LOCKING_ANDX);

        // Header is 32 bytes; word count, AndX prefix, then the FID.
        let words = 32;
        assert_eq!(packet[words], 8);
        assert_eq!(packet[words + 1], 0xFF);
        let fid = u16::from_le_bytes([packet[words + 5], packet[words + 6]]);
        assert_eq!(fid, 0x4001);
        assert_eq!(packet[words + 7], LOCK_TYPE_BREAK);
        assert_eq!(packet[words + 8], NEW_LEVEL_NONE);
    }

    #[test]
    fn break_to_level2_sets_shared_bit() {
        let packet = break_request(3, 7, OplockLevel::Level2);
        let words = 32;
        assert_eq!(packet[words + 7], LOCK_TYPE_BREAK | LOCK_TYPE_SHARED);
        assert_eq!(packet[words + 8], NEW_LEVEL_II);
    }

    #[test]
    fn packet_has_fixed_length() {
        let packet = break_request(0, 0, OplockLevel::None);
        // 32 header + 1 word count + 16 parameter bytes + 2 byte count.
        assert_eq!(packet.len(), 51);
    }
}
