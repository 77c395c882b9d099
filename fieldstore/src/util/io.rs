use std::borrow::Cow;

use bitbuff::{BitReader, BitWriter};

use crate::error::{DbResult, Error};

/// Defines a common serialization/deserialization interface based in the
/// [`bitbuff`] stream types.
///
/// Besides the name inspiration, this has nothing to do with the
/// [serde](https://serde.rs) crate. :P
pub trait Serde {
    /// Serializes the value.
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()>;

    /// Deserializes the value.
    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self>
    where
        Self: Sized;
}

/// Like [`Serde`], but deserialization needs some outside context (e.g. the
/// already known schemas).
pub trait SerdeCtx {
    type DeCtx<'de>;

    /// Serializes the value.
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()>;

    /// Deserializes the value.
    fn deserialize(buf: &mut BitReader<'_>, ctx: Self::DeCtx<'_>) -> DbResult<Self>
    where
        Self: Sized;
}

/// Asserts that the next `expected.len()` bytes are equal to `expected`.
///
/// Returns `true` is the read string was correctly verified.
pub fn read_verify_eq(buf: &mut BitReader<'_>, expected: &[u8]) -> DbResult<bool> {
    for byte in expected {
        if *byte != buf.read::<u8>()? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Serde wrapper for a variable-length list.
pub struct VarList<'a, T>(pub Cow<'a, [T]>)
where
    [T]: ToOwned;

impl<'a, T> Serde for VarList<'a, T>
where
    T: Serde + Clone,
{
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        let len = u16::try_from(self.0.len())
            .map_err(|_| Error::Corrupted("list has more than u16::MAX items".into()))?;
        buf.write(len);
        for item in self.0.iter() {
            item.serialize(buf)?;
        }
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self>
    where
        Self: Sized,
    {
        let len: u16 = buf.read()?;
        let inner = (0..len)
            .map(|_| T::deserialize(buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VarList(Cow::Owned(inner)))
    }
}

impl<'a, T: Clone> From<&'a [T]> for VarList<'a, T> {
    fn from(value: &'a [T]) -> Self {
        VarList(Cow::Borrowed(value))
    }
}

impl<T: Clone> From<Vec<T>> for VarList<'_, T> {
    fn from(value: Vec<T>) -> Self {
        VarList(Cow::Owned(value))
    }
}

impl<'a, T: Clone> From<VarList<'a, T>> for Vec<T> {
    fn from(value: VarList<'a, T>) -> Self {
        value.0.into_owned()
    }
}

/// Serde wrapper for variable-length serialization format for byte strings.
///
/// The length prefix has 32 bits, since encoded records may be large.
pub struct VarBytes<'a>(pub Cow<'a, [u8]>);

impl Serde for VarBytes<'_> {
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        let len = u32::try_from(self.0.len())
            .map_err(|_| Error::Corrupted("byte string longer than u32::MAX".into()))?;
        buf.write(len);
        buf.write_slice(&self.0);
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self>
    where
        Self: Sized,
    {
        let len: u32 = buf.read()?;
        if len as usize > buf.remaining() / 8 {
            return Err(Error::Corrupted("byte string length out of bounds".into()));
        }
        let mut bytes = vec![0; len as usize];
        buf.read_slice(&mut bytes)?;
        Ok(VarBytes(Cow::Owned(bytes)))
    }
}

/// [`Serde`] wrapper for variable-length serialization format for strings.
pub struct VarString<'a>(pub Cow<'a, str>);

impl Serde for VarString<'_> {
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        VarBytes(Cow::Borrowed(self.0.as_bytes())).serialize(buf)
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self>
    where
        Self: Sized,
    {
        let bytes = VarBytes::deserialize(buf)?.0.into_owned();
        let string = String::from_utf8(bytes).map_err(|_| Error::CorruptedUtf8)?;
        Ok(VarString(Cow::Owned(string)))
    }
}

macro_rules! impl_from_var {
    ($borrowed:ty, $owned:ty => $var:ident) => {
        impl<'a> From<&'a $borrowed> for $var<'a> {
            fn from(value: &'a $borrowed) -> Self {
                $var(Cow::Borrowed(value))
            }
        }

        impl From<$owned> for $var<'_> {
            fn from(value: $owned) -> Self {
                $var(Cow::Owned(value))
            }
        }

        impl From<$var<'_>> for $owned {
            fn from(value: $var<'_>) -> Self {
                value.0.into_owned()
            }
        }
    };
}

impl_from_var!([u8], Vec<u8> => VarBytes);
impl_from_var!(str, String => VarString);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_string_unaligned() {
        let mut buf = BitWriter::new();
        buf.write(true);
        VarString::from("olá").serialize(&mut buf).unwrap();
        let bytes = buf.into_bytes();

        let mut buf = BitReader::new(&bytes);
        assert!(buf.read::<bool>().unwrap());
        let s: String = VarString::deserialize(&mut buf).unwrap().into();
        assert_eq!(s, "olá");
    }

    #[test]
    fn test_var_bytes_bad_length() {
        let mut buf = BitWriter::new();
        buf.write(1000_u32);
        buf.write_slice(b"abc");
        let bytes = buf.into_bytes();

        let mut buf = BitReader::new(&bytes);
        assert!(matches!(
            VarBytes::deserialize(&mut buf),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_verify_eq() {
        let mut buf = BitReader::new(b"magic!");
        assert!(read_verify_eq(&mut buf, b"magic").unwrap());
        let mut buf = BitReader::new(b"magic!");
        assert!(!read_verify_eq(&mut buf, b"nope").unwrap());
    }
}
