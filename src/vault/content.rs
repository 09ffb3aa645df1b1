//! 内容存储：单文件负载的压缩、解压和摘要
//!
//! 压缩使用 gzip（头部 mtime 固定为 0，同样的输入总是得到同样的输出），
//! 解压同时接受 gzip 和旧版工具写出的 zlib 流。
//! 摘要使用 SHA-256，只用于恢复后的完整性校验，不用于去重或寻址。

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use sha2::{Digest, Sha256};

use super::error::VaultError;

/// gzip 魔数
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 压缩字节
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(bytes.len() / 2 + 32),
        Compression::default(),
    );
    // 目标是内存中的 Vec，写入不会失败
    encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .unwrap_or_else(|e| unreachable!("gzip 写入内存缓冲失败: {}", e))
}

/// zlib 头：CM = 8 (deflate)，且 (CMF * 256 + FLG) 是 31 的倍数
fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0f == 8 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

/// 解压字节
///
/// 按头部识别格式：`1f 8b` 为 gzip，合法的 zlib 头为 zlib，其他一律返回
/// [`VaultError::CorruptArchive`]。流被截断、校验和或长度不符时同样返回该错误。
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, VaultError> {
    match bytes {
        [a, b, ..] if [*a, *b] == GZIP_MAGIC => {
            let mut out = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| VaultError::CorruptArchive(e.to_string()))?;
            Ok(out)
        }
        [cmf, flg, ..] if is_zlib_header(*cmf, *flg) => inflate_zlib(bytes),
        _ => Err(VaultError::CorruptArchive(
            "不是 gzip 或 zlib 数据".to_string(),
        )),
    }
}

/// 解压完整的 zlib 流，必须读到流结尾
fn inflate_zlib(bytes: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(bytes.len() * 4 + 64);
    loop {
        let consumed = inflater.total_in() as usize;
        let status = inflater
            .decompress_vec(&bytes[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| VaultError::CorruptArchive(e.to_string()))?;
        match status {
            Status::StreamEnd => return Ok(out),
            _ if out.len() == out.capacity() => out.reserve(out.capacity()),
            _ => return Err(VaultError::CorruptArchive("zlib 数据被截断".to_string())),
        }
    }
}

/// 计算 SHA-256 摘要（小写十六进制，64 个字符）
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let inputs: [&[u8]; 4] = [
            b"",
            b"print(1)",
            "# 中文注释\nprint('hi')\n".as_bytes(),
            &[0u8, 255, 1, 254, 0, 0, 0, 7],
        ];
        for input in inputs {
            assert_eq!(decompress(&compress(input)).unwrap(), input);
        }

        let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(decompress(&compress(&large)).unwrap(), large);
    }

    #[test]
    fn test_compress_is_deterministic() {
        assert_eq!(compress(b"echo hello"), compress(b"echo hello"));
    }

    #[test]
    fn test_empty_input_is_valid_stream() {
        let compressed = compress(b"");
        assert!(!compressed.is_empty());
        assert!(decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(matches!(decompress(b""), Err(VaultError::CorruptArchive(_))));
        assert!(matches!(
            decompress(b"print(1)"),
            Err(VaultError::CorruptArchive(_))
        ));
    }

    /// Python `zlib.compress(b"print(1)")` 的输出
    const LEGACY_ZLIB_PRINT: [u8; 16] = [
        120, 156, 43, 40, 202, 204, 43, 209, 48, 212, 4, 0, 14, 21, 2, 176,
    ];

    #[test]
    fn test_decompress_accepts_legacy_zlib() {
        assert_eq!(decompress(&LEGACY_ZLIB_PRINT).unwrap(), b"print(1)");

        let mut truncated = LEGACY_ZLIB_PRINT.to_vec();
        truncated.truncate(10);
        assert!(matches!(
            decompress(&truncated),
            Err(VaultError::CorruptArchive(_))
        ));

        // 头部合法但 adler32 错误
        let mut bad_adler = LEGACY_ZLIB_PRINT;
        bad_adler[15] ^= 0xff;
        assert!(decompress(&bad_adler).is_err());
    }

    #[test]
    fn test_decompress_rejects_truncated() {
        let compressed = compress(b"#!/bin/sh\necho backup\n");
        let truncated = &compressed[..compressed.len() / 2];
        assert!(matches!(
            decompress(truncated),
            Err(VaultError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_decompress_rejects_bad_checksum() {
        let mut compressed = compress(b"some script body");
        // 尾部 8 字节是 CRC32 + ISIZE
        let crc_pos = compressed.len() - 8;
        compressed[crc_pos] ^= 0xff;
        assert!(decompress(&compressed).is_err());
    }

    #[test]
    fn test_digest() {
        let d = digest(b"print(1)");
        assert_eq!(d.len(), 64);
        assert_eq!(d, digest(b"print(1)"));
        assert!(d.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
