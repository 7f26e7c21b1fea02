use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;
use crate::decode::Parser;
use crate::{Error, Result};

// Deserializes a value from a complete bencoded buffer, failing closed on
// trailing bytes.
pub fn from_bytes<'de, T>(input: &'de [u8]) -> Result<T>
where
    T: de::Deserialize<'de>,
{
    let mut de = Deserializer {
        parser: Parser { input, pos: 0 },
    };
    let value = T::deserialize(&mut de)?;
    if de.parser.pos != input.len() {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

pub struct Deserializer<'de> {
    parser: Parser<'de>,
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Deserializer<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.parser.peek()? {
            b'i' => {
                self.parser.pos += 1;
                visitor.visit_i64(self.parser.parse_int()?)
            }
            b'0'..=b'9' => visitor.visit_borrowed_bytes(self.parser.parse_bytes()?),
            b'l' => {
                self.parser.pos += 1;
                visitor.visit_seq(Access { de: self })
            }
            b'd' => {
                self.parser.pos += 1;
                visitor.visit_map(Access { de: self })
            }
            found => Err(Error::InvalidToken {
                expected: "one of 'i', 'l', 'd' or a digit",
                found: (found as char).to_string(),
            }),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64
        u8 u16 u32 u64
        f32 f64
        unit unit_struct
        seq map struct tuple tuple_struct
        enum ignored_any
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_borrowed_bytes(self.parser.parse_bytes()?)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let bytes = self.parser.parse_bytes()?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Error::Custom(format!("invalid utf-8 string: {}", e)))?;
        visitor.visit_borrowed_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    // Bencode has no null; a present value is always Some.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }
}

// Walks list elements and dict entries; the terminating 'e' is consumed when
// the next element is requested past the end.
struct Access<'a, 'de> {
    de: &'a mut Deserializer<'de>,
}

impl<'de, 'a> SeqAccess<'de> for Access<'a, 'de> {

    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        if self.de.parser.peek()? == b'e' {
            self.de.parser.pos += 1;
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }
}

impl<'de, 'a> MapAccess<'de> for Access<'a, 'de> {

    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        if self.de.parser.peek()? == b'e' {
            self.de.parser.pos += 1;
            return Ok(None);
        }
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.de)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Inner {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        count: u32,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Outer {
        name: String,
        #[serde(default)]
        missing: Option<i64>,
        inner: Inner,
        tags: Vec<String>,
    }

    #[test]
    fn test_from_bytes_struct() {
        let raw = b"d5:innerd5:counti3e4:data3:\x00\x01\x02e4:name4:test4:tagsl1:a1:bee";
        let out: Outer = from_bytes(raw).unwrap();
        assert_eq!(
            out,
            Outer {
                name: "test".to_string(),
                missing: None,
                inner: Inner { data: vec![0, 1, 2], count: 3 },
                tags: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_from_bytes_unknown_fields_ignored() {
        #[derive(Debug, Deserialize)]
        struct Sparse {
            count: u32,
        }
        let raw = b"d5:counti7e5:extral1:xi9eee";
        let out: Sparse = from_bytes(raw).unwrap();
        assert_eq!(out.count, 7);
    }

    #[test]
    fn test_from_bytes_rejects_trailing() {
        let result: Result<i64> = from_bytes(b"i1ei2e");
        assert!(matches!(result, Err(Error::TrailingBytes)));
    }
}
