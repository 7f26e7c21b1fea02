use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::store::FileInfo;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("piece count does not match total length")]
    InvalidPieceCount,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    pub name: String,

    // Concatenation of all 20-byte SHA-1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default)]
    pub md5sum: Option<String>,

    // Set for single-file torrents.
    #[serde(default)]
    pub length: Option<u64>,

    // Set for multi-file torrents.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // If "1", peers may only be obtained from the declared trackers.
    #[serde(default)]
    pub private: Option<u8>,

}

impl Info {
    // SHA-1 over the canonically re-encoded info dict; the torrent identity.
    fn info_hash(&self) -> Result<[u8; 20], MetaInfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        let info_data = bencode::to_bytes(&self)?;
        hasher.update(info_data);
        Ok(hasher.finalize().into())
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    pub info_hash: [u8; 20],

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    // WebSeed URLs, BEP 19.
    #[serde(default)]
    #[serde(rename = "url-list")]
    #[serde(deserialize_with = "crate::de::url_list_deserialize")]
    pub url_list: Option<Vec<url::Url>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = bencode::from_bytes(raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        let piece_len = metainfo.info.piece_length as u64;
        let expected = (metainfo.total_len() + piece_len - 1) / piece_len;
        if expected != metainfo.num_pieces() as u64 {
            return Err(MetaInfoError::InvalidPieceCount);
        }

        for file in metainfo.info.files.iter().flatten() {
            if file.length == 0 {
                return Err(MetaInfoError::FileNoSize);
            }
            if file.path.is_empty() {
                return Err(MetaInfoError::FileEmptyPath);
            }
            if file.path.iter().any(|c| c == ".." || c.starts_with('/')) {
                return Err(MetaInfoError::FileAbsolutePath);
            }
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as length was checked to be a multiple of 20 on load.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker tiers; order within a tier is shuffled per BEP 12.
    pub fn trackers(&self) -> Vec<Vec<url::Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::new();
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else {
            vec![vec![self.announce.clone()]]
        }
    }

    pub fn webseeds(&self) -> Vec<url::Url> {
        self.url_list.clone().unwrap_or_default()
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.join("/").into(),
                    length: f.length,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0),
                offset: 0,
                md5sum: self.info.md5sum.clone(),
            }]
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v| v.as_str()).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("url_list", &self.url_list.as_ref().map(|v|
                v.iter().map(|v| v.as_str()).collect::<Vec<&str>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Pieces would swamp the output, so Debug is manual.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::Value;

    // Builds a well-formed single-file torrent in memory.
    pub(crate) fn single_file_torrent(piece_length: u32, length: u64) -> Vec<u8> {
        let num_pieces = ((length + piece_length as u64 - 1) / piece_length as u64) as usize;
        let mut info = Value::dict();
        info.insert("name", Value::bytes("test.bin"));
        info.insert("piece length", Value::Int(piece_length as i64));
        info.insert("length", Value::Int(length as i64));
        info.insert("pieces", Value::Bytes(vec![0xab; num_pieces * 20]));

        let mut root = Value::dict();
        root.insert("announce", Value::bytes("http://tracker.example/announce"));
        root.insert("info", info);
        bencode::encode(&root)
    }

    #[test]
    fn test_metainfo_single_file() {
        let raw = single_file_torrent(32_768, 100_000);
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();
        assert_eq!(metainfo.num_pieces(), 4);
        assert_eq!(metainfo.piece_len(), 32_768);
        assert_eq!(metainfo.total_len(), 100_000);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.piece_hashes().len(), 4);
    }

    #[test]
    fn test_info_hash_matches_raw_info_dict() {
        use sha1::Digest;
        let raw = single_file_torrent(16_384, 16_384);
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();

        // Locate the raw info dict and hash it directly.
        let root = bencode::decode(&raw).unwrap();
        let info = root.get(b"info").unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(bencode::encode(info));
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn test_metainfo_multi_file() {
        let mut info = Value::dict();
        info.insert("name", Value::bytes("dir"));
        info.insert("piece length", Value::Int(16_384));
        info.insert("pieces", Value::Bytes(vec![0u8; 20]));
        let mut f1 = Value::dict();
        f1.insert("length", Value::Int(6000));
        f1.insert("path", Value::List(vec![Value::bytes("a"), Value::bytes("b.bin")]));
        let mut f2 = Value::dict();
        f2.insert("length", Value::Int(4000));
        f2.insert("path", Value::List(vec![Value::bytes("c.bin")]));
        info.insert("files", Value::List(vec![f1, f2]));

        let mut root = Value::dict();
        root.insert("announce", Value::bytes("http://tracker.example/announce"));
        root.insert("info", info);

        let metainfo = MetaInfo::from_bytes(&bencode::encode(&root)).unwrap();
        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.total_len(), 10_000);
        let files = metainfo.files();
        assert_eq!(files[0].path, std::path::PathBuf::from("a/b.bin"));
        assert_eq!(files[1].offset, 6000);
    }

    #[test]
    fn test_metainfo_rejects_bad_pieces() {
        let mut info = Value::dict();
        info.insert("name", Value::bytes("x"));
        info.insert("piece length", Value::Int(16_384));
        info.insert("length", Value::Int(100));
        info.insert("pieces", Value::Bytes(vec![0u8; 19]));
        let mut root = Value::dict();
        root.insert("announce", Value::bytes("http://t.example/a"));
        root.insert("info", info);

        assert!(matches!(
            MetaInfo::from_bytes(&bencode::encode(&root)),
            Err(MetaInfoError::InvalidPiecesLength)
        ));
    }
}
