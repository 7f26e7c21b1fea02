use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.

pub fn url_deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Url::parse(&s).map_err(de::Error::custom)
}

pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<Vec<String>>::deserialize(deserializer)?;
    let mut announce_list = Vec::new();

    for tier in raw {
        let mut urls = Vec::new();
        for url in tier {
            urls.push(Url::parse(&url).map_err(de::Error::custom)?);
        }
        announce_list.push(urls);
    }

    let total = announce_list.iter().map(|v| v.len()).sum::<usize>();
    if total == 0 { Ok(None) } else { Ok(Some(announce_list)) }
}

// "url-list" may be a single string or a list of strings; unparsable entries
// are skipped rather than failing the whole metainfo.
pub fn url_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Url>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct UrlListVisitor;

    impl<'de> de::Visitor<'de> for UrlListVisitor {
        type Value = Vec<Url>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a url string or a list of url strings")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let s = std::str::from_utf8(v).map_err(E::custom)?;
            Ok(Url::parse(s).into_iter().collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut urls = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                if let Ok(url) = Url::parse(&s) {
                    urls.push(url);
                }
            }
            Ok(urls)
        }
    }

    let urls = deserializer.deserialize_any(UrlListVisitor)?;
    if urls.is_empty() { Ok(None) } else { Ok(Some(urls)) }
}
