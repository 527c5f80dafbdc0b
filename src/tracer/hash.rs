//! Correlation id hashing.
//!
//! Bob Jenkins' lookup3 final mixing in the form the Linux kernel ships as
//! `jhash_3words`/`jhash_2words`, so ids match what an in-kernel probe
//! computes for the same inputs.

/// Arbitrary initial value shared with the kernel implementation.
pub const JHASH_INITVAL: u32 = 0xdead_beef;

#[inline(always)]
fn final_mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c.wrapping_sub(b.rotate_left(24))
}

#[inline(always)]
fn jhash_nwords(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    final_mix(
        a.wrapping_add(initval),
        b.wrapping_add(initval),
        c.wrapping_add(initval),
    )
}

/// Hash three words. The word count is folded into the seed.
#[inline]
pub fn jhash_3words(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    jhash_nwords(a, b, c, initval.wrapping_add(JHASH_INITVAL).wrapping_add(3 << 2))
}

/// Hash two words. The word count is folded into the seed.
#[inline]
pub fn jhash_2words(a: u32, b: u32, initval: u32) -> u32 {
    jhash_nwords(a, b, 0, initval.wrapping_add(JHASH_INITVAL).wrapping_add(2 << 2))
}

/// Fold a 64-bit value into 32 bits by xoring the halves.
#[inline]
pub const fn fold32(v: u64) -> u32 {
    (v ^ (v >> 32)) as u32
}

/// Correlation id for one packet's traversal of the ruleset.
///
/// Packet memory is recycled, so ids are only stable for the lifetime of a
/// single traversal and may collide across packets.
#[inline]
pub fn trace_id(identity: u64, flow_hash: u32, iif: u32) -> u32 {
    jhash_2words(fold32(identity), flow_hash, iif)
}
