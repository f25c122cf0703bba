//! Cluster key slots.
//!
//! Keys map to one of 16384 slots by CRC16-XMODEM (polynomial 0x1021, zero
//! seed) of the key, or of its hash tag when the key carries one.

use crate::command::Command;
use crate::error::{RespError, Result};

/// Number of hash slots in a Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

const POLY: u16 = 0x1021;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut crc = (byte as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[byte] = crc;
        byte += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// CRC16-XMODEM checksum of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ TABLE[((crc >> 8) as u8 ^ b) as usize]
    })
}

/// The part of `key` that is hashed: the bytes between the first `{` and the
/// next `}` when that span is non-empty, otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = memchr::memchr(b'{', key) else {
        return key;
    };
    let rest = &key[open + 1..];
    match memchr::memchr(b'}', rest) {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Slot of the command's first key, or `None` for keyless commands.
pub fn command_slot(cmd: &Command) -> Option<u16> {
    cmd.key().map(|k| key_slot(&k))
}

/// The single slot shared by every keyed command in `cmds`.
///
/// Keyless commands are ignored. Two keyed commands on different slots are
/// a `CROSSSLOT` error since a batch runs on one connection.
pub fn common_slot(cmds: &[Command]) -> Result<Option<u16>> {
    let mut slot = None;
    for cmd in cmds {
        let Some(s) = command_slot(cmd) else {
            continue;
        };
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => {
                return Err(RespError::Cluster(format!(
                    "CROSSSLOT keys in batch map to slots {prev} and {s}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b""), 0);
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn known_slots() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"123456789"), 0x31C3 % SLOT_COUNT);
    }

    #[test]
    fn hash_tags() {
        assert_eq!(hash_tag(b"{user:1000}.following"), b"user:1000");
        assert_eq!(hash_tag(b"prefix{tag}suffix"), b"tag");
        assert_eq!(hash_tag(b"mykey"), b"mykey");
        assert_eq!(hash_tag(b"{}mykey"), b"{}mykey");
        assert_eq!(hash_tag(b"{mykey"), b"{mykey");
        assert_eq!(hash_tag(b"{a}{b}"), b"a");
        assert_eq!(hash_tag(b"{{nested}}"), b"{nested");
        assert_eq!(hash_tag(b"}x{tag}"), b"tag");
    }

    #[test]
    fn tagged_keys_share_slot() {
        assert_eq!(key_slot(b"{user:1000}.following"), key_slot(b"{user:1000}.followers"));
        assert_eq!(key_slot(b"{tag}:rest"), crc16(b"tag") % SLOT_COUNT);
    }

    #[test]
    fn slot_of_commands() {
        assert_eq!(command_slot(&Command::new("GET").arg("foo")), Some(12182));
        assert_eq!(command_slot(&Command::new("PING")), None);
    }

    #[test]
    fn common_slot_checks() {
        let same = [
            Command::new("SET").arg("{u}a").arg("1"),
            Command::new("PING"),
            Command::new("GET").arg("{u}b"),
        ];
        assert_eq!(common_slot(&same).unwrap(), Some(key_slot(b"u")));

        let mixed = [Command::new("GET").arg("foo"), Command::new("GET").arg("bar")];
        match common_slot(&mixed) {
            Err(RespError::Cluster(msg)) => assert!(msg.starts_with("CROSSSLOT")),
            other => panic!("expected CROSSSLOT, got {other:?}"),
        }

        assert_eq!(common_slot(&[Command::new("PING")]).unwrap(), None);
    }
}
