//! Security tokens
//!
//! Every process carries a token whose checksum is a salted FNV-1a hash
//! over the token's identity fields, XOR-combined with a salted hash of
//! the owning PID. The construction detects accidental corruption and
//! unsophisticated tampering; it is deliberately not a cryptographic MAC.

use bitflags::bitflags;

/// Well-known token magic.
const TOKEN_MAGIC: u64 = 0x5EC0_DE4D_4147_4943;
/// Hash salt folded into every checksum.
const TOKEN_SALT: u64 = 0xDEAD_BEEF_CAFE_BABE;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Privilege level a process runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Privilege {
    /// Kernel-trusted system process.
    System = 0,
    /// Ordinary process.
    User = 1,
    /// Sandboxed process with reduced rights.
    Restricted = 2,
}

bitflags! {
    /// Security flags carried in a token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenFlags: u32 {
        /// Cannot be terminated except by the integrity monitor.
        const IMMUNE     = 1 << 0;
        /// As IMMUNE, and losing it is fatal; killing it is a violation.
        const CRITICAL   = 1 << 1;
        /// May create SYSTEM-privilege processes.
        const SUPERVISOR = 1 << 3;
    }
}

impl TokenFlags {
    /// The full trust bundle handed to kernel-core processes.
    pub const CORE: Self = Self::IMMUNE.union(Self::CRITICAL).union(Self::SUPERVISOR);
}

/// Tamper-evident process token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityToken {
    pub magic: u64,
    pub creator_pid: u32,
    pub privilege: Privilege,
    pub flags: TokenFlags,
    pub creation_tick: u64,
    pub checksum: u64,
}

fn fnv1a(bytes: &[u8], salt: u64) -> u64 {
    let mut hash = salt;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fixed-layout serialization of the fields covered by the checksum.
fn identity_bytes(token: &SecurityToken) -> [u8; 25] {
    let mut out = [0u8; 25];
    out[0..8].copy_from_slice(&token.magic.to_le_bytes());
    out[8..12].copy_from_slice(&token.creator_pid.to_le_bytes());
    out[12] = token.privilege as u8;
    out[13..17].copy_from_slice(&token.flags.bits().to_le_bytes());
    out[17..25].copy_from_slice(&token.creation_tick.to_le_bytes());
    out
}

fn checksum_for(token: &SecurityToken, pid: u32) -> u64 {
    let base = fnv1a(&identity_bytes(token), TOKEN_SALT);
    let pid_hash = fnv1a(&pid.to_le_bytes(), TOKEN_SALT);
    base ^ pid_hash
}

impl SecurityToken {
    /// A zeroed token; never validates.
    pub const fn empty() -> Self {
        Self {
            magic: 0,
            creator_pid: 0,
            privilege: Privilege::Restricted,
            flags: TokenFlags::empty(),
            creation_tick: 0,
            checksum: 0,
        }
    }

    /// Issue a fresh token bound to `pid`.
    pub fn issue(
        pid: u32,
        creator_pid: u32,
        privilege: Privilege,
        flags: TokenFlags,
        creation_tick: u64,
    ) -> Self {
        let mut token = Self {
            magic: TOKEN_MAGIC,
            creator_pid,
            privilege,
            flags,
            creation_tick,
            checksum: 0,
        };
        token.checksum = checksum_for(&token, pid);
        token
    }

    /// Constant-time validation: the XOR of checksum and magic differences
    /// is folded into one word that must be zero.
    pub fn validate(&self, pid: u32) -> bool {
        let checksum_diff = checksum_for(self, pid) ^ self.checksum;
        let magic_diff = self.magic ^ TOKEN_MAGIC;
        (checksum_diff | magic_diff) == 0
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_validates() {
        let token = SecurityToken::issue(7, 1, Privilege::User, TokenFlags::empty(), 1234);
        assert!(token.validate(7));
    }

    #[test]
    fn wrong_pid_fails() {
        let token = SecurityToken::issue(7, 1, Privilege::User, TokenFlags::empty(), 1234);
        assert!(!token.validate(8));
    }

    #[test]
    fn empty_token_never_validates() {
        assert!(!SecurityToken::empty().validate(0));
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let pid = 42;
        let token = SecurityToken::issue(pid, 1, Privilege::System, TokenFlags::CORE, 99);

        for bit in 0..64 {
            let mut t = token;
            t.magic ^= 1 << bit;
            assert!(!t.validate(pid), "magic bit {} flip missed", bit);
        }
        for bit in 0..32 {
            let mut t = token;
            t.creator_pid ^= 1 << bit;
            assert!(!t.validate(pid), "creator bit {} flip missed", bit);
        }
        for bit in 0..32 {
            let mut t = token;
            t.flags = TokenFlags::from_bits_retain(t.flags.bits() ^ (1 << bit));
            assert!(!t.validate(pid), "flags bit {} flip missed", bit);
        }
        for bit in 0..64 {
            let mut t = token;
            t.creation_tick ^= 1 << bit;
            assert!(!t.validate(pid), "tick bit {} flip missed", bit);
        }
        for bit in 0..64 {
            let mut t = token;
            t.checksum ^= 1 << bit;
            assert!(!t.validate(pid), "checksum bit {} flip missed", bit);
        }
    }

    #[test]
    fn privilege_change_is_detected() {
        let token = SecurityToken::issue(3, 0, Privilege::User, TokenFlags::empty(), 5);
        let mut t = token;
        t.privilege = Privilege::System;
        assert!(!t.validate(3));
    }
}
