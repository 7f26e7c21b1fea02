use std::collections::BTreeMap;

// A decoded bencode value. Dictionaries are kept in a BTreeMap so that
// re-encoding always emits keys in lexicographical order.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {

    pub fn bytes<T: AsRef<[u8]>>(b: T) -> Self {
        Value::Bytes(b.as_ref().to_vec())
    }

    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    // Byte strings are not guaranteed to be UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    // Keyed-map accessors, only meaningful on dictionaries.

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<&BTreeMap<Vec<u8>, Value>> {
        self.get(key).and_then(Value::as_dict)
    }

    pub fn insert<K: AsRef<[u8]>>(&mut self, key: K, value: Value) {
        if let Value::Dict(d) = self {
            d.insert(key.as_ref().to_vec(), value);
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Bytes(s.as_bytes().to_vec()) }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self { Value::Bytes(b) }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self { Value::List(l) }
}

// Byte strings print as strings when valid UTF-8, else as hex-ish escapes.
impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::Int(i) => write!(f, "{}", i),
            Value::List(l) => f.debug_list().entries(l.iter()).finish(),
            Value::Dict(d) => f
                .debug_map()
                .entries(d.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}
