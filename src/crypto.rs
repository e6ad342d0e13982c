//! Carrier payload cipher. Every frame's bytes past the 3-byte length
//! prefix are XOR-masked with a keystream derived from the shared password
//! and a coarse time bucket; the prefix stays in the clear so the receiver
//! can assemble the frame before decrypting. The mask is self-inverse, so
//! `encrypt` and `decrypt` are the same transform.
//!
//! With the `simple-crypto` feature the keystream collapses to a constant
//! byte mask. That variant is an obfuscation fallback, not security.

/// Width of the cipher time bucket in seconds. Coarse enough that both ends
/// of a carrier land in the same bucket despite clock skew and frames in
/// flight; receivers additionally retry the previous bucket (see
/// `local`/`remote` frame assembly).
pub const TIME_BUCKET_SECS: u64 = 64;

/// Derive the 64-bit carrier key from the shared password (FNV-1a).
pub fn hash_key(password: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in password.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Map a unix timestamp to its cipher bucket.
#[inline]
pub fn time_bucket(now_secs: u64) -> u64 {
    now_secs / TIME_BUCKET_SECS
}

#[cfg(not(feature = "simple-crypto"))]
#[inline]
fn keystream_seed(key: u64, bucket: u64) -> u64 {
    // Zero would jam the xorshift generator
    let seed = key ^ bucket.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    if seed == 0 {
        0x6a09_e667_f3bc_c909
    } else {
        seed
    }
}

/// XOR the data in place with the keyed, time-bucketed keystream.
#[cfg(not(feature = "simple-crypto"))]
pub fn encrypt(data: &mut [u8], key: u64, bucket: u64) {
    let mut state = keystream_seed(key, bucket);

    for chunk in data.chunks_mut(8) {
        // xorshift64*
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let word = state.wrapping_mul(0x2545_f491_4f6c_dd1d);

        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte ^= (word >> (i * 8)) as u8;
        }
    }
}

/// XOR the data in place with a constant mask, ignoring key and bucket.
#[cfg(feature = "simple-crypto")]
pub fn encrypt(data: &mut [u8], _key: u64, _bucket: u64) {
    for byte in data.iter_mut() {
        *byte ^= 0x99;
    }
}

/// Inverse of `encrypt`. The keystream is an XOR mask, so this is the same
/// transform; the separate name keeps call sites honest.
#[inline]
pub fn decrypt(data: &mut [u8], key: u64, bucket: u64) {
    encrypt(data, key, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key("p"), hash_key("p"));
        assert_ne!(hash_key("p"), hash_key("q"));
        assert_ne!(hash_key(""), hash_key("p"));
    }

    #[test]
    fn test_time_bucket_coarse() {
        assert_eq!(time_bucket(0), time_bucket(TIME_BUCKET_SECS - 1));
        assert_ne!(time_bucket(0), time_bucket(TIME_BUCKET_SECS));
    }

    #[test]
    fn test_roundtrip_all_sizes() {
        let key = hash_key("secret");

        for size in 0..70 {
            let plain: Vec<u8> = (0..size).map(|item| item as u8).collect();
            let mut data = plain.clone();

            encrypt(&mut data, key, 12345);
            decrypt(&mut data, key, 12345);

            assert_eq!(data, plain, "size {}", size);
        }
    }

    #[cfg(not(feature = "simple-crypto"))]
    #[test]
    fn test_ciphertext_differs_from_plain() {
        let key = hash_key("secret");
        let plain = [0u8; 32];
        let mut data = plain;

        encrypt(&mut data, key, 1);

        assert_ne!(&data[..], &plain[..]);
    }

    #[cfg(not(feature = "simple-crypto"))]
    #[test]
    fn test_bucket_mismatch_garbles() {
        let key = hash_key("secret");
        let plain: Vec<u8> = (0..32).collect();
        let mut data = plain.clone();

        encrypt(&mut data, key, 1);
        decrypt(&mut data, key, 2);

        assert_ne!(data, plain);
    }

    #[cfg(not(feature = "simple-crypto"))]
    #[test]
    fn test_key_mismatch_garbles() {
        let plain: Vec<u8> = (0..32).collect();
        let mut data = plain.clone();

        encrypt(&mut data, hash_key("one"), 7);
        decrypt(&mut data, hash_key("two"), 7);

        assert_ne!(data, plain);
    }
}
