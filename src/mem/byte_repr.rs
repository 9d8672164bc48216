//! Fixed-width element codec for global memory.
//!
//! Global segments hold raw bytes; typed access goes through this trait. It
//! is the seam the block codec of the origin layer plugs into: every element
//! type has a fixed encoded width and little-endian layout, so any rank can
//! decode any other rank's shard.

/// A value with a fixed-width byte representation.
pub trait ByteRepr: Copy + Default + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Encodes into `buf`, which is exactly `SIZE` bytes.
    fn store(&self, buf: &mut [u8]);

    /// Decodes from `buf`, which is exactly `SIZE` bytes.
    fn load(buf: &[u8]) -> Self;
}

macro_rules! int_byte_repr {
    ($($ty:ty),*) => {$(
        impl ByteRepr for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn store(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_le_bytes());
            }

            fn load(buf: &[u8]) -> Self {
                <$ty>::from_le_bytes(buf.try_into().expect("byte width mismatch"))
            }
        }
    )*};
}

int_byte_repr!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl ByteRepr for usize {
    const SIZE: usize = 8;

    fn store(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&(*self as u64).to_le_bytes());
    }

    fn load(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf.try_into().expect("byte width mismatch")) as Self
    }
}

impl ByteRepr for bool {
    const SIZE: usize = 1;

    fn store(&self, buf: &mut [u8]) {
        buf[0] = u8::from(*self);
    }

    fn load(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

/// Decodes `count` values from `bytes`.
#[must_use]
pub fn decode_slice<T: ByteRepr>(bytes: &[u8], count: usize) -> Vec<T> {
    debug_assert_eq!(bytes.len(), count * T::SIZE);
    (0..count)
        .map(|i| T::load(&bytes[i * T::SIZE..(i + 1) * T::SIZE]))
        .collect()
}

/// Encodes `values` into a fresh byte vector.
#[must_use]
pub fn encode_slice<T: ByteRepr>(values: &[T]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * T::SIZE];
    for (i, v) in values.iter().enumerate() {
        v.store(&mut bytes[i * T::SIZE..(i + 1) * T::SIZE]);
    }
    bytes
}
