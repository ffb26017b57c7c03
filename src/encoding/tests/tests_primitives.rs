//! Byte-layout tests for the primitive encoders.
//!
//! The ledger log and the SSTable format both rely on these exact layouts,
//! so each test pins the encoded bytes rather than only checking a
//! round-trip.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn u64_is_little_endian() {
        let bytes = encode_to_vec(&0x0102_0304_0506_0708u64).unwrap();
        assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        let (decoded, consumed) = decode_from_slice::<u64>(&bytes).unwrap();
        assert_eq!(decoded, 0x0102_0304_0506_0708);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn u16_and_u32_are_little_endian() {
        assert_eq!(encode_to_vec(&0x1234u16).unwrap(), [0x34, 0x12]);
        assert_eq!(
            encode_to_vec(&0xDEAD_BEEFu32).unwrap(),
            [0xEF, 0xBE, 0xAD, 0xDE]
        );
    }

    #[test]
    fn byte_string_carries_u32_length_prefix() {
        let bytes = encode_to_vec(&b"abc".to_vec()).unwrap();
        assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);
        let (decoded, consumed) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
        assert_eq!(decoded, b"abc");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn fixed_array_has_no_prefix() {
        let bytes = encode_to_vec(&[9u8; 8]).unwrap();
        assert_eq!(bytes.len(), 8);
        let (decoded, _) = decode_from_slice::<[u8; 8]>(&bytes).unwrap();
        assert_eq!(decoded, [9u8; 8]);
    }

    /// # Scenario
    /// Several fields are decoded back to back with `decode_at`.
    ///
    /// # Expected behavior
    /// The shared offset ends exactly at the end of the buffer.
    #[test]
    fn decode_at_walks_fields_in_order() {
        let mut buf = Vec::new();
        7u64.encode_to(&mut buf).unwrap();
        b"key".to_vec().encode_to(&mut buf).unwrap();
        3u32.encode_to(&mut buf).unwrap();

        let mut offset = 0;
        assert_eq!(decode_at::<u64>(&buf, &mut offset).unwrap(), 7);
        assert_eq!(decode_at::<Vec<u8>>(&buf, &mut offset).unwrap(), b"key");
        assert_eq!(decode_at::<u32>(&buf, &mut offset).unwrap(), 3);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn u64_vector_round_trips() {
        let ids: Vec<u64> = vec![1, 5, 9, u64::MAX];
        let bytes = encode_to_vec(&ids).unwrap();
        assert_eq!(bytes.len(), 4 + 8 * ids.len());
        let (decoded, consumed) = decode_from_slice::<Vec<u64>>(&bytes).unwrap();
        assert_eq!(decoded, ids);
        assert_eq!(consumed, bytes.len());
    }
}
