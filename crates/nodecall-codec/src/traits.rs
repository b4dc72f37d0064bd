use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::reader::Reader;
use crate::writer::Writer;

/// A value with a fixed binary layout.
pub trait Encode {
    fn encode(&self, writer: &mut Writer);
}

/// A value that can be read back from its binary layout.
pub trait Decode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self>;
}

macro_rules! impl_fixed_width {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, writer: &mut Writer) {
                    writer.put_slice(&self.to_le_bytes());
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut Reader<'_>) -> Result<Self> {
                    Ok(<$ty>::from_le_bytes(reader.read_array()?))
                }
            }
        )+
    };
}

impl_fixed_width!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

// Platform-sized integers always travel as 64 bits.
impl Encode for usize {
    fn encode(&self, writer: &mut Writer) {
        (*self as u64).encode(writer);
    }
}

impl Decode for usize {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let value = u64::decode(reader)?;
        usize::try_from(value).map_err(|_| CodecError::IntegerOverflow(value))
    }
}

impl Encode for isize {
    fn encode(&self, writer: &mut Writer) {
        (*self as i64).encode(writer);
    }
}

impl Decode for isize {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let value = i64::decode(reader)?;
        isize::try_from(value).map_err(|_| CodecError::IntegerOverflow(value as u64))
    }
}

impl Encode for bool {
    fn encode(&self, writer: &mut Writer) {
        writer.put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        match u8::decode(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl Encode for char {
    fn encode(&self, writer: &mut Writer) {
        u32::from(*self).encode(writer);
    }
}

impl Decode for char {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let scalar = u32::decode(reader)?;
        char::from_u32(scalar).ok_or(CodecError::InvalidChar(scalar))
    }
}

impl Encode for () {
    fn encode(&self, _writer: &mut Writer) {}
}

impl Decode for () {
    fn decode(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Encode for str {
    fn encode(&self, writer: &mut Writer) {
        writer.write_len(self.len());
        writer.put_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut Writer) {
        self.as_str().encode(writer);
    }
}

impl Decode for String {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let bytes = reader.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Encode for Bytes {
    fn encode(&self, writer: &mut Writer) {
        writer.write_len(self.len());
        writer.put_slice(self);
    }
}

impl Decode for Bytes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        Ok(Bytes::copy_from_slice(reader.take(len)?))
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, writer: &mut Writer) {
        (**self).encode(writer);
    }
}

impl<T: Encode + ?Sized> Encode for Box<T> {
    fn encode(&self, writer: &mut Writer) {
        (**self).encode(writer);
    }
}

impl<T: Decode> Decode for Box<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        T::decode(reader).map(Box::new)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, writer: &mut Writer) {
        match self {
            Some(value) => {
                writer.put_u8(1);
                value.encode(writer);
            }
            None => writer.put_u8(0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => T::decode(reader).map(Some),
            tag => Err(CodecError::InvalidOptionTag(tag)),
        }
    }
}

fn encode_seq<'a, T, I>(writer: &mut Writer, len: usize, items: I)
where
    T: Encode + 'a,
    I: IntoIterator<Item = &'a T>,
{
    writer.write_len(len);
    for item in items {
        item.encode(writer);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, writer: &mut Writer) {
        encode_seq(writer, self.len(), self);
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, writer: &mut Writer) {
        self.as_slice().encode(writer);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut out = Vec::with_capacity(reader.capacity_hint(len, 1));
        for _ in 0..len {
            out.push(T::decode(reader)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for VecDeque<T> {
    fn encode(&self, writer: &mut Writer) {
        encode_seq(writer, self.len(), self);
    }
}

impl<T: Decode> Decode for VecDeque<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Vec::decode(reader).map(VecDeque::from)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, writer: &mut Writer) {
        encode_seq(writer, self.len(), self);
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut out = BTreeSet::new();
        for _ in 0..len {
            out.insert(T::decode(reader)?);
        }
        Ok(out)
    }
}

impl<T: Encode, S> Encode for HashSet<T, S> {
    fn encode(&self, writer: &mut Writer) {
        encode_seq(writer, self.len(), self);
    }
}

impl<T, S> Decode for HashSet<T, S>
where
    T: Decode + Eq + Hash,
    S: BuildHasher + Default,
{
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut out = HashSet::with_capacity_and_hasher(reader.capacity_hint(len, 1), S::default());
        for _ in 0..len {
            out.insert(T::decode(reader)?);
        }
        Ok(out)
    }
}

fn encode_map<'a, K, V, I>(writer: &mut Writer, len: usize, entries: I)
where
    K: Encode + 'a,
    V: Encode + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    writer.write_len(len);
    for (key, value) in entries {
        key.encode(writer);
        value.encode(writer);
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, writer: &mut Writer) {
        encode_map(writer, self.len(), self);
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut out = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(reader)?;
            let value = V::decode(reader)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode, S> Encode for HashMap<K, V, S> {
    fn encode(&self, writer: &mut Writer) {
        encode_map(writer, self.len(), self);
    }
}

impl<K, V, S> Decode for HashMap<K, V, S>
where
    K: Decode + Eq + Hash,
    V: Decode,
    S: BuildHasher + Default,
{
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut out = HashMap::with_capacity_and_hasher(reader.capacity_hint(len, 2), S::default());
        for _ in 0..len {
            let key = K::decode(reader)?;
            let value = V::decode(reader)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

macro_rules! impl_tuple {
    ($($name:ident)+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, writer: &mut Writer) {
                let ($($name,)+) = self;
                $($name.encode(writer);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(reader: &mut Reader<'_>) -> Result<Self> {
                Ok(($($name::decode(reader)?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A B);
impl_tuple!(A B C);
impl_tuple!(A B C D);
impl_tuple!(A B C D E);
impl_tuple!(A B C D E F);
impl_tuple!(A B C D E F G);
impl_tuple!(A B C D E F G H);
impl_tuple!(A B C D E F G H I);
impl_tuple!(A B C D E F G H I J);
impl_tuple!(A B C D E F G H I J K);
impl_tuple!(A B C D E F G H I J K L);
