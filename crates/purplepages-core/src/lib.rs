pub mod event;
pub mod filter;
pub mod kind;
mod timestamp;

pub use event::{Address, Event, Tag};
pub use filter::Filter;
pub use kind::{Kind, KindSet};
pub use timestamp::Timestamp;

/// Define a fixed-size byte-array newtype with hex `Display`/`FromStr` and
/// the serde/bincode impls every purplepages identifier needs.
///
/// Human-readable serde formats (JSON on the wire) get lowercase hex;
/// binary formats (bincode inside redb) get the raw bytes.
#[macro_export]
macro_rules! define_hex_array_type {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $(#[$outer])*
        #[derive(Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq)]
        #[derive(::bincode::Encode, ::bincode::Decode)]
        pub struct $t([u8; $n]);

        impl $t {
            pub const ZERO: Self = Self([0u8; $n]);
            pub const MAX: Self = Self([0xffu8; $n]);

            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn from_bytes(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(self) -> [u8; $n] {
                self.0
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::HEXLOWER.encode_write(self.as_slice(), f)
            }
        }

        impl std::fmt::Debug for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let v = data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }

        impl ::serde::Serialize for $t {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                if s.is_human_readable() {
                    s.serialize_str(&self.to_string())
                } else {
                    s.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> ::serde::de::Deserialize<'de> for $t {
            fn deserialize<D>(d: D) -> Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                if d.is_human_readable() {
                    let str = <String>::deserialize(d)?;
                    <Self as std::str::FromStr>::from_str(&str).map_err(|e| {
                        ::serde::de::Error::custom(format!("Deserialization error: {e:#}"))
                    })
                } else {
                    let bytes = <Vec<u8>>::deserialize(d)?;
                    let a: [u8; $n] = bytes
                        .try_into()
                        .map_err(|_| ::serde::de::Error::custom("Invalid length"))?;
                    Ok(Self(a))
                }
            }
        }
    }
}

define_hex_array_type!(
    /// A 32-byte event id: the content-address of an [`Event`].
    struct EventId, 32
);

define_hex_array_type!(
    /// A 32-byte author public key.
    struct Pubkey, 32
);

define_hex_array_type!(
    /// A 64-byte event signature.
    ///
    /// The signature is verified by the wire codec before an event reaches
    /// this crate; the core only carries it around.
    struct Sig, 64
);

impl From<EventId> for [u8; 32] {
    fn from(value: EventId) -> Self {
        value.0
    }
}

impl From<Pubkey> for [u8; 32] {
    fn from(value: Pubkey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = EventId::from_bytes([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(EventId::from_str(&s).expect("valid hex"), id);
    }

    #[test]
    fn hex_rejects_bad_length() {
        assert!(EventId::from_str("abcd").is_err());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let small = EventId::from_bytes({
            let mut b = [0xff; 32];
            b[0] = 0x00;
            b
        });
        let big = EventId::from_bytes({
            let mut b = [0x00; 32];
            b[0] = 0x01;
            b
        });
        assert!(small < big);
        assert!(EventId::ZERO < small);
        assert!(big < EventId::MAX);
    }

    #[test]
    fn serde_json_is_hex_string() {
        let pk = Pubkey::from_bytes([0x01; 32]);
        let json = serde_json::to_string(&pk).expect("serializes");
        assert_eq!(json, format!("\"{pk}\""));
        let back: Pubkey = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, pk);
    }
}
