use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::matrix::{MatrixError, TransitionMatrix};
use crate::store::atomic::atomic_write;

pub const MATRIX_SUFFIX: &str = ".matrix.zst";

#[derive(Debug, Serialize, Deserialize)]
struct MatrixPayload {
    size: usize,
    entries: Vec<(usize, usize, u64)>,
}

pub fn encode_matrix(matrix: &TransitionMatrix) -> io::Result<Vec<u8>> {
    let payload = MatrixPayload {
        size: matrix.size(),
        entries: matrix.entries().collect(),
    };
    let json = serde_json::to_vec(&payload).map_err(io::Error::other)?;
    zstd::stream::encode_all(json.as_slice(), 0)
}

/// Decodes a payload. Out-of-range indices and duplicate entries whose
/// counts overflow are reported as the reason string.
pub fn decode_matrix(input: &[u8]) -> Result<TransitionMatrix, String> {
    let decompressed = zstd::stream::decode_all(input).map_err(|err| err.to_string())?;
    let payload: MatrixPayload =
        serde_json::from_slice(&decompressed).map_err(|err| err.to_string())?;
    let mut matrix = TransitionMatrix::new(payload.size);
    for (row, col, count) in payload.entries {
        matrix.add(row, col, count).map_err(|err| err.to_string())?;
    }
    Ok(matrix)
}

pub fn read_matrix(path: &Path) -> Result<TransitionMatrix, MatrixError> {
    let display = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            MatrixError::MissingSource {
                path: display,
            }
        } else {
            MatrixError::Io {
                path: display,
                source: err,
            }
        }
    })?;
    decode_source(path, &bytes)
}

/// Decodes bytes already read from `path`, naming the path on failure.
pub fn decode_source(path: &Path, bytes: &[u8]) -> Result<TransitionMatrix, MatrixError> {
    decode_matrix(bytes).map_err(|reason| MatrixError::Corrupt {
        path: path.display().to_string(),
        reason,
    })
}

pub fn write_matrix(path: &Path, matrix: &TransitionMatrix) -> Result<(), MatrixError> {
    let io_err = |source| MatrixError::Io {
        path: path.display().to_string(),
        source,
    };
    let bytes = encode_matrix(matrix).map_err(io_err)?;
    atomic_write(path, &bytes).map_err(io_err)
}

pub fn is_matrix_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(MATRIX_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_matrix_reads_back_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("20240101/0000.matrix.zst");
        let matrix = TransitionMatrix::from_dense(&[vec![0, 4], vec![9, 1]]).expect("matrix");

        write_matrix(&path, &matrix).expect("write");
        let loaded = read_matrix(&path).expect("read");
        assert_eq!(loaded, matrix);
    }

    #[test]
    fn missing_file_is_reported_as_missing_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_matrix(&dir.path().join("absent.matrix.zst")).expect_err("missing");
        assert!(matches!(err, MatrixError::MissingSource { .. }));
    }

    #[test]
    fn out_of_range_entries_are_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.matrix.zst");
        let json = br#"{"size":2,"entries":[[0,5,1]]}"#;
        let bytes = zstd::stream::encode_all(&json[..], 0).expect("compress");
        std::fs::write(&path, bytes).expect("write");

        let err = read_matrix(&path).expect_err("corrupt");
        assert!(matches!(err, MatrixError::Corrupt { .. }));
    }

    #[test]
    fn duplicate_entries_that_overflow_are_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("overflow.matrix.zst");
        let json = br#"{"size":2,"entries":[[0,1,18446744073709551615],[0,1,1]]}"#;
        let bytes = zstd::stream::encode_all(&json[..], 0).expect("compress");
        std::fs::write(&path, bytes).expect("write");

        match read_matrix(&path) {
            Err(MatrixError::Corrupt { path: named, reason }) => {
                assert!(named.ends_with("overflow.matrix.zst"));
                assert!(reason.contains("overflows"), "reason: {reason}");
            }
            other => panic!("expected corrupt source, got {other:?}"),
        }
    }

    #[test]
    fn uncompressed_garbage_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("garbage.matrix.zst");
        std::fs::write(&path, b"not zstd").expect("write");
        assert!(matches!(
            read_matrix(&path),
            Err(MatrixError::Corrupt { .. })
        ));
    }

    #[test]
    fn recognises_matrix_suffix() {
        assert!(is_matrix_file(Path::new("/data/0100.matrix.zst")));
        assert!(!is_matrix_file(Path::new("/data/0100.json")));
    }
}
