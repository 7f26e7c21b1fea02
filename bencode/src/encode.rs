use crate::Value;

// Canonical emission: dict keys come out of the BTreeMap already sorted.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;

    #[test]
    fn test_encode_primitives() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-42)), b"i-42e");
        assert_eq!(encode(&Value::bytes("spam")), b"4:spam");
    }

    #[test]
    fn test_encode_dict_sorted() {
        let mut d = Value::dict();
        d.insert("foo", Value::Int(42));
        d.insert("bar", Value::bytes("spam"));
        // Insertion order does not matter, emission is sorted.
        assert_eq!(encode(&d), b"d3:bar4:spam3:fooi42ee");
    }

    #[test]
    fn test_encode_decode_identity() {
        let mut inner = Value::dict();
        inner.insert("x", Value::Int(0));
        let v = Value::List(vec![Value::bytes(""), Value::Int(i64::MIN), inner]);
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }
}
