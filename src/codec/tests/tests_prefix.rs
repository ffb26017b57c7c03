//! Key-prefix extraction and partition dispatch tests.

#[cfg(test)]
mod tests {
    use crate::codec::*;
    use rand::Rng;

    #[test]
    fn short_keys_are_right_padded() {
        assert_eq!(key_prefix(b""), 0);
        assert_eq!(key_prefix(b"\x01"), 0x0100_0000_0000_0000);
        assert_eq!(key_prefix(b"1000"), 0x3130_3030_0000_0000);
    }

    #[test]
    fn long_keys_use_first_eight_bytes() {
        assert_eq!(key_prefix(b"abcdefghXYZ"), key_prefix(b"abcdefgh"));
        assert_eq!(key_prefix(b"abcdefgh"), u64::from_be_bytes(*b"abcdefgh"));
    }

    /// # Scenario
    /// Random pairs of keys that differ within their first eight bytes.
    ///
    /// # Expected behavior
    /// Lexicographic order of the keys equals numeric order of the prefixes.
    #[test]
    fn prefix_preserves_lexicographic_order() {
        let mut rng = rand::rng();
        let mut checked = 0;
        while checked < 5_000 {
            let len_a = rng.random_range(1..12);
            let len_b = rng.random_range(1..12);
            let a: Vec<u8> = (0..len_a).map(|_| rng.random()).collect();
            let b: Vec<u8> = (0..len_b).map(|_| rng.random()).collect();
            let head_a = &a[..a.len().min(8)];
            let head_b = &b[..b.len().min(8)];
            // Skip pairs where one head is a prefix of the other.
            if head_a.starts_with(head_b) || head_b.starts_with(head_a) {
                continue;
            }
            assert_eq!(a.cmp(&b), key_prefix(&a).cmp(&key_prefix(&b)));
            checked += 1;
        }
    }

    #[test]
    fn dispatch_splits_range_evenly() {
        assert_eq!(dispatch(0, 4), 0);
        assert_eq!(dispatch((1 << 62) - 1, 4), 0);
        assert_eq!(dispatch(1 << 62, 4), 1);
        assert_eq!(dispatch(1 << 63, 4), 2);
        assert_eq!(dispatch(3 << 62, 4), 3);
        assert_eq!(dispatch(u64::MAX, 4), 3);
    }

    /// # Scenario
    /// Prefixes on both sides of every partition boundary `k * 2^64 / n`,
    /// for partition counts that do and do not divide 2^64.
    ///
    /// # Expected behavior
    /// The prefix just below a boundary stays in partition `k - 1`, the
    /// boundary itself opens partition `k`, and no prefix ever maps to `n`.
    #[test]
    fn dispatch_boundaries_match_range_width() {
        assert_eq!(dispatch(0x7fff_ffff_ffff_ffff, 2), 0);
        assert_eq!(dispatch(0x8000_0000_0000_0000, 2), 1);

        for n in [2u32, 3, 4, 7, 10, 255, 256] {
            for k in 1..n {
                // Smallest prefix with prefix * n >= k * 2^64.
                let boundary = ((u128::from(k) << 64).div_ceil(u128::from(n))) as u64;
                assert_eq!(dispatch(boundary - 1, n), k - 1, "n={n} k={k}");
                assert_eq!(dispatch(boundary, n), k, "n={n} k={k}");
            }
            assert_eq!(dispatch(u64::MAX, n), n - 1);
        }
    }

    #[test]
    fn dispatch_single_partition() {
        assert_eq!(dispatch(u64::MAX, 1), 0);
        assert_eq!(dispatch(12345, 1), 0);
    }

    #[test]
    fn ascii_digit_keys_land_in_first_quarter() {
        for i in 1000..2000u32 {
            assert_eq!(dispatch(key_prefix(i.to_string().as_bytes()), 4), 0);
        }
    }
}
