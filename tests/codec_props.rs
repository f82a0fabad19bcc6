// SPDX-License-Identifier: MIT

//! Property tests for scalars at arbitrary bit offsets.

use hidschema::codec::Codec;
use hidschema::Value;
use proptest::prelude::*;

/// `codec` preceded by `offset` bits of padding.
fn at_offset(offset: usize, codec: Codec) -> Codec {
    if offset == 0 {
        Codec::array([codec])
    } else {
        Codec::array([Codec::padding(offset), codec])
    }
}

fn value_at(offset: usize, value: Value) -> Value {
    if offset == 0 {
        Value::List(vec![value])
    } else {
        Value::List(vec![Value::Integer(0), value])
    }
}

fn as_u128(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .enumerate()
        .fold(0u128, |acc, (i, b)| acc | (u128::from(*b) << (8 * i)))
}

fn uint_width() -> impl Strategy<Value = u8> {
    prop::sample::select(vec![1u8, 2, 3, 4, 5, 6, 7, 8, 16, 32, 64])
}

fn mask(bits: u8) -> u64 {
    match bits {
        // Value::Integer holds at most i64::MAX
        64 => i64::MAX as u64,
        n => (1u64 << n) - 1,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_uint_round_trip(offset in 0usize..8, bits in uint_width(), raw in any::<u64>()) {
        let codec = at_offset(offset, Codec::uint(bits).unwrap());
        let value = value_at(offset, Value::from(raw & mask(bits)));
        let bytes = codec.pack(&value).unwrap();
        prop_assert_eq!(bytes.len(), (offset + usize::from(bits)).div_ceil(8));
        let parsed = codec.parse(&bytes).unwrap();
        prop_assert_eq!(parsed.data, value);
        prop_assert_eq!(parsed.size, bytes.len());
    }

    #[test]
    fn prop_int_round_trip(offset in 0usize..8, bits in prop::sample::select(vec![8u8, 16, 32]), raw in any::<i32>()) {
        let codec = at_offset(offset, Codec::int(bits).unwrap());
        let value = value_at(offset, Value::from(raw >> (32 - bits)));
        let bytes = codec.pack(&value).unwrap();
        prop_assert_eq!(codec.parse(&bytes).unwrap().data, value);
    }

    #[test]
    fn prop_float_round_trip(offset in 0usize..8, single in any::<f32>(), double in any::<f64>()) {
        prop_assume!(single.is_finite() && double.is_finite());
        let codec = at_offset(offset, Codec::float(32).unwrap());
        let value = value_at(offset, Value::from(single));
        prop_assert_eq!(codec.parse(&codec.pack(&value).unwrap()).unwrap().data, value);

        let codec = at_offset(offset, Codec::float(64).unwrap());
        let value = value_at(offset, Value::from(double));
        prop_assert_eq!(codec.parse(&codec.pack(&value).unwrap()).unwrap().data, value);
    }

    #[test]
    fn prop_bytes_round_trip(offset in 0usize..8, data in prop::collection::vec(any::<u8>(), 0..8)) {
        let codec = at_offset(offset, Codec::bytes(data.len()));
        let value = value_at(offset, Value::Bytes(data));
        prop_assert_eq!(codec.parse(&codec.pack(&value).unwrap()).unwrap().data, value);
    }

    /// Packing after `offset` bits equals the aligned encoding shifted
    /// left by `offset` bits.
    #[test]
    fn prop_offset_is_a_shift(offset in 0usize..8, bits in uint_width(), raw in any::<u64>()) {
        let scalar = Codec::uint(bits).unwrap();
        let v = Value::from(raw & mask(bits));
        let aligned = as_u128(&scalar.pack(&v).unwrap());
        let shifted = as_u128(&at_offset(offset, scalar).pack(&value_at(offset, v)).unwrap());
        prop_assert_eq!(shifted, aligned << offset);
    }
}
