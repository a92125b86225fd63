use std::ffi::OsStr;

/// 32-bit string hash shared with the wire protocol. Both ends of the
/// monitor link must agree bit-exactly, so this must stay MurmurHash2
/// with seed 0.
pub(crate) fn hash32(input: &OsStr) -> u32 {
    // 'm' and 'r' are mixing constants generated offline.
    // They're not really 'magic', they just happen to work well.
    let m: u32 = 0x5bd1e995;
    let r = 24;

    let data = input.as_encoded_bytes();
    let seed = 0usize;
    let h = (seed ^ data.len()) as u32;

    let mut chunks = data.chunks_exact(4);

    // Mix 4 bytes at a time into the hash
    let mut h = (&mut chunks).fold(h, |mut h: u32, k| {
        let mut k = u32::from_ne_bytes(k.try_into().unwrap());
        k = k.wrapping_mul(m);
        k ^= k >> r;
        k = k.wrapping_mul(m);
        h = h.wrapping_mul(m);
        h ^= k;
        h
    });

    match chunks.remainder() {
        [a] => {
            h ^= *a as u32;
            h = h.wrapping_mul(m);
        }
        [a, b] => {
            h ^= *a as u32;
            h ^= (*b as u32) << 8;
            h = h.wrapping_mul(m);
        }
        [a, b, c] => {
            h ^= *a as u32;
            h ^= (*b as u32) << 8;
            h ^= (*c as u32) << 16;
            h = h.wrapping_mul(m);
        }
        _ => (),
    }

    h ^= h >> 13;
    h = h.wrapping_mul(m);
    h ^= h >> 15;

    h
}

/// 64-bit tag bloom word. Three disjoint 6-bit slices of the string
/// hash select the bits to set; a device's bloom is the OR across its
/// tags. False positives are possible, false negatives are not.
pub(crate) fn bloom64(input: &OsStr) -> u64 {
    let mut bits = 0;
    let hash = hash32(input);
    bits |= 1 << (hash & 63);
    bits |= 1 << ((hash >> 6) & 63);
    bits |= 1 << ((hash >> 12) & 63);
    bits
}

pub(crate) fn bloom_contains(device_bits: u64, tag_bits: u64) -> bool {
    device_bits & tag_bits == tag_bits
}
