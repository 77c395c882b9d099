use crate::AsBits;

macro_rules! unsigned_impls {
    ($($type:ty),+) => {
        $(
            impl crate::AsBits for $type {
                const BITS: u32 = <$type>::BITS;

                fn to_bits(&self) -> u64 {
                    u64::from(*self)
                }

                fn from_bits(src: u64) -> Self {
                    src as $type
                }
            }
        )+
    }
}

macro_rules! signed_impls {
    ($($type:ty),+) => {
        $(
            impl crate::AsBits for $type {
                const BITS: u32 = <$type>::BITS;

                fn to_bits(&self) -> u64 {
                    // Keep only the type's own bits of the two's complement form.
                    (*self as u64) & (u64::MAX >> (64 - <$type>::BITS))
                }

                fn from_bits(src: u64) -> Self {
                    src as $type
                }
            }
        )+
    }
}

unsigned_impls![u8, u16, u32, u64];
signed_impls![i8, i16, i32, i64];

impl AsBits for f32 {
    const BITS: u32 = 32;

    fn to_bits(&self) -> u64 {
        u64::from(f32::to_bits(*self))
    }

    fn from_bits(src: u64) -> Self {
        f32::from_bits(src as u32)
    }
}

impl AsBits for f64 {
    const BITS: u32 = 64;

    fn to_bits(&self) -> u64 {
        f64::to_bits(*self)
    }

    fn from_bits(src: u64) -> Self {
        f64::from_bits(src)
    }
}

impl AsBits for bool {
    const BITS: u32 = 1;

    fn to_bits(&self) -> u64 {
        u64::from(*self)
    }

    fn from_bits(src: u64) -> Self {
        src & 1 == 1
    }
}
