use std::{ops::Range, path::PathBuf};
use serde_derive::{Deserialize, Serialize};
use crate::metainfo::MetaInfo;

// File information derived from metainfo.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileInfo {

    pub path: PathBuf,

    pub length: u64,

    // Offset from the start of the torrent viewed as one byte array.
    #[serde(skip)]
    pub offset: u64,

    #[serde(default)]
    pub md5sum: Option<String>,

}

impl FileInfo {
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

// One slice of a block as it lands in a physical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {

    pub file_idx: usize,

    // Offset within that file.
    pub offset: u64,

    pub len: usize,

}

// Maps the torrent's logical (piece, offset) address space onto files.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    pub total_len: u64,

    pub piece_len: usize,

    // The final piece is usually shorter.
    pub last_piece_len: usize,

    pub num_pieces: u32,

    pub files: Vec<FileInfo>,

    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    pub fn piece_len(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    pub fn abs_path(&self, file_idx: usize) -> PathBuf {
        self.output_dir.join(&self.files[file_idx].path)
    }

    // Splits (piece, offset, len) into per-file slices, in file order. A
    // block can straddle any number of small files.
    pub fn file_slices(&self, piece_idx: usize, offset_in_piece: usize, len: usize) -> Vec<FileSlice> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");
        debug_assert!(offset_in_piece + len <= self.piece_len(piece_idx));

        let mut abs = self.piece_offset(piece_idx) + offset_in_piece as u64;
        let end = abs + len as u64;
        let mut slices = Vec::with_capacity(1);

        for (file_idx, file) in self.files.iter().enumerate() {
            let range = file.byte_range();
            if range.end <= abs {
                continue;
            }
            if range.start >= end {
                break;
            }
            let slice_len = (end.min(range.end) - abs) as usize;
            slices.push(FileSlice {
                file_idx,
                offset: abs - range.start,
                len: slice_len,
            });
            abs += slice_len as u64;
            if abs == end {
                break;
            }
        }

        debug_assert_eq!(abs, end, "block runs past the last file");
        slices
    }

    // Indexes of the first and last file a piece touches.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        let slices = self.file_slices(piece_idx, 0, self.piece_len(piece_idx));
        match (slices.first(), slices.last()) {
            (Some(first), Some(last)) => first.file_idx..last.file_idx + 1,
            _ => 0..0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_file_info() -> StoreInfo {
        // Three files of 6000, 4000 and 22768 bytes; 32768-byte pieces.
        StoreInfo {
            total_len: 32_768,
            piece_len: 16_384,
            last_piece_len: 16_384,
            num_pieces: 2,
            files: vec![
                FileInfo { path: "a".into(), length: 6000, offset: 0, md5sum: None },
                FileInfo { path: "b".into(), length: 4000, offset: 6000, md5sum: None },
                FileInfo { path: "c".into(), length: 22_768, offset: 10_000, md5sum: None },
            ],
            output_dir: "out".into(),
        }
    }

    #[test]
    fn test_file_slices_single_file() {
        let mut info = multi_file_info();
        info.files = vec![FileInfo { path: "a".into(), length: 32_768, offset: 0, md5sum: None }];
        let slices = info.file_slices(1, 0, 16_384);
        assert_eq!(slices, vec![FileSlice { file_idx: 0, offset: 16_384, len: 16_384 }]);
    }

    #[test]
    fn test_file_slices_straddles_files() {
        let info = multi_file_info();
        let slices = info.file_slices(0, 0, 16_384);
        assert_eq!(slices, vec![
            FileSlice { file_idx: 0, offset: 0, len: 6000 },
            FileSlice { file_idx: 1, offset: 0, len: 4000 },
            FileSlice { file_idx: 2, offset: 0, len: 6384 },
        ]);
    }

    #[test]
    fn test_file_slices_interior_block() {
        let info = multi_file_info();
        let slices = info.file_slices(0, 8192, 4096);
        assert_eq!(slices, vec![
            FileSlice { file_idx: 1, offset: 2192, len: 1808 },
            FileSlice { file_idx: 2, offset: 0, len: 2288 },
        ]);
    }

    #[test]
    fn test_piece_file_intersections() {
        let info = multi_file_info();
        assert_eq!(info.piece_file_intersections(0), 0..3);
        assert_eq!(info.piece_file_intersections(1), 2..3);
    }

    #[test]
    fn test_last_piece_len() {
        let info = StoreInfo {
            total_len: 100_000,
            piece_len: 32_768,
            last_piece_len: 100_000 - 3 * 32_768,
            num_pieces: 4,
            files: vec![FileInfo { path: "a".into(), length: 100_000, offset: 0, md5sum: None }],
            output_dir: "out".into(),
        };
        assert_eq!(info.piece_len(3), 1696);
        assert_eq!(info.piece_len(0), 32_768);
        let slices = info.file_slices(3, 0, info.piece_len(3));
        assert_eq!(slices[0].len, 1696);
    }
}
