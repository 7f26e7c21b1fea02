use serde::ser;
use crate::{Error, Result};

// Serializes a value to canonical bencode. Struct fields and map entries are
// buffered and emitted in lexicographical key order, whatever order serde
// visits them in; `None` fields are omitted entirely.
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>>
where
    T: serde::Serialize,
{
    let mut serializer = Serializer::default();
    value.serialize(&mut serializer)?;
    Ok(serializer.out)
}

#[derive(Default)]
pub struct Serializer {
    out: Vec<u8>,
}

impl Serializer {
    fn push<T: AsRef<[u8]>>(&mut self, bytes: T) {
        self.out.extend_from_slice(bytes.as_ref());
    }

    fn push_string(&mut self, bytes: &[u8]) {
        self.push(bytes.len().to_string());
        self.push(":");
        self.push(bytes);
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {

    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = MapSerializer<'a>;
    type SerializeStruct = MapSerializer<'a>;
    type SerializeStructVariant = MapSerializer<'a>;

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.push("i");
        self.push(v.to_string());
        self.push("e");
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.push("i");
        self.push(v.to_string());
        self.push("e");
        Ok(())
    }

    fn serialize_bool(self, v: bool) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i8(self, v: i8) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i16(self, v: i16) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_i32(self, v: i32) -> Result<()> { self.serialize_i64(v as i64) }
    fn serialize_u8(self, v: u8) -> Result<()> { self.serialize_u64(v as u64) }
    fn serialize_u16(self, v: u16) -> Result<()> { self.serialize_u64(v as u64) }
    fn serialize_u32(self, v: u32) -> Result<()> { self.serialize_u64(v as u64) }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::InvalidType("f32".to_string()))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::InvalidType("f64".to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.push_string(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.serialize_bytes(v.as_bytes())
    }

    fn serialize_char(self, v: char) -> Result<()> {
        let mut buf = [0; 4];
        self.serialize_bytes(v.encode_utf8(&mut buf).as_bytes())
    }

    // None serializes to nothing; the map layer drops the whole entry.
    fn serialize_none(self) -> Result<()> { Ok(()) }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> { Ok(()) }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> { Ok(()) }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()>
    where
        T: serde::Serialize,
    {
        self.push("d");
        self.push_string(variant.as_bytes());
        value.serialize(&mut *self)?;
        self.push("e");
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        self.push("l");
        Ok(self)
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        self.push("d");
        self.push_string(variant.as_bytes());
        self.push("l");
        Ok(self)
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(MapSerializer::new(self, len.unwrap_or(0)))
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        self.push("d");
        self.push_string(variant.as_bytes());
        self.serialize_map(Some(len))
    }
}

impl ser::SerializeSeq for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.push("e");
        Ok(())
    }
}

impl ser::SerializeTuple for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleVariant for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.push("ee");
        Ok(())
    }
}

// Buffers encoded (key, value) pairs so dictionaries always emit in
// lexicographical key order regardless of visit order.
pub struct MapSerializer<'a> {
    serializer: &'a mut Serializer,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pending_key: Option<Vec<u8>>,
}

impl<'a> MapSerializer<'a> {

    fn new(serializer: &'a mut Serializer, capacity: usize) -> Self {
        Self {
            serializer,
            entries: Vec::with_capacity(capacity),
            pending_key: None,
        }
    }

    fn encode_key<K: ?Sized>(key: &K) -> Result<Vec<u8>>
    where
        K: serde::Serialize,
    {
        // Keys must be byte strings; serialize then strip the length prefix.
        let mut ser = Serializer::default();
        key.serialize(&mut ser)?;
        let raw = ser.out;
        let colon = raw
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::MapSerialization("dictionary key is not a string".to_string()))?;
        Ok(raw[colon + 1..].to_vec())
    }

    fn finish(&mut self) -> Result<()> {
        if self.pending_key.is_some() {
            return Err(Error::MapSerialization(
                "map ended while holding an unpaired key".to_string(),
            ));
        }
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        self.serializer.push("d");
        for (key, value) in entries {
            self.serializer.push_string(&key);
            self.serializer.push(value);
        }
        self.serializer.push("e");
        Ok(())
    }

    fn push_entry<V: ?Sized>(&mut self, key: Vec<u8>, value: &V) -> Result<()>
    where
        V: serde::Serialize,
    {
        let mut ser = Serializer::default();
        value.serialize(&mut ser)?;
        // Empty output means the value was None; omit the entry.
        if !ser.out.is_empty() {
            self.entries.push((key, ser.out));
        }
        Ok(())
    }
}

impl<'a> ser::SerializeMap for MapSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        if self.pending_key.is_some() {
            return Err(Error::MapSerialization(
                "consecutive keys without a value".to_string(),
            ));
        }
        self.pending_key = Some(Self::encode_key(key)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        let key = self.pending_key.take().ok_or_else(|| {
            Error::MapSerialization("value without a preceding key".to_string())
        })?;
        self.push_entry(key, value)
    }

    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl<'a> ser::SerializeStruct for MapSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        self.push_entry(key.as_bytes().to_vec(), value)
    }

    fn end(mut self) -> Result<()> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for MapSerializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        self.push_entry(key.as_bytes().to_vec(), value)
    }

    fn end(mut self) -> Result<()> {
        self.finish()?;
        self.serializer.push("e");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::from_bytes;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        // Field declaration order is deliberately unsorted.
        name: String,
        #[serde(rename = "piece length")]
        piece_length: u32,
        length: Option<u64>,
        #[serde(with = "serde_bytes")]
        pieces: Vec<u8>,
    }

    #[test]
    fn test_struct_emits_sorted_keys() {
        let rec = Record {
            name: "file.bin".to_string(),
            piece_length: 16384,
            length: Some(100),
            pieces: vec![0xab; 20],
        };
        let raw = to_bytes(&rec).unwrap();
        // length < name < piece length < pieces.
        assert!(raw.starts_with(b"d6:lengthi100e4:name8:file.bin12:piece lengthi16384e"));
        let back: Record = from_bytes(&raw).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_none_fields_are_omitted() {
        let rec = Record {
            name: "x".to_string(),
            piece_length: 1,
            length: None,
            pieces: vec![],
        };
        let raw = to_bytes(&rec).unwrap();
        assert_eq!(raw, b"d4:name1:x12:piece lengthi1e6:pieces0:e".to_vec());
    }

    #[test]
    fn test_serialize_roundtrips_through_value() {
        let rec = Record {
            name: "spam".to_string(),
            piece_length: 2,
            length: Some(4),
            pieces: vec![1, 2, 3],
        };
        let raw = to_bytes(&rec).unwrap();
        let value = crate::decode(&raw).unwrap();
        assert_eq!(crate::encode(&value), raw);
    }
}
