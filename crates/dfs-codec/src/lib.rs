#![forbid(unsafe_code)]
//! Checksum, encryption and compression transforms for the data path.
//!
//! All transforms are stateless functions over byte ranges. Encrypted
//! extents use a ChaCha20 keystream whose identity is `(version, keystream
//! offset)`: the extent version selects the IV and the CRC descriptor's
//! `nonce` field gives the sector offset of the stored coverage within that
//! keystream. Subrange operations (partial decrypt, rechecksum, splicing)
//! carry the per-byte keystream identity by seeking, so a given
//! `(key, version, offset)` triple is never applied to two different
//! plaintexts.
//!
//! Poly1305 MAC keys are derived from the same ChaCha20 key at a distinct
//! IV domain, so MAC keystream never overlaps data keystream.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use dfs_error::{DfsError, Result};
use dfs_types::{DeviceIdx, SECTOR_SIZE, Version};
use poly1305::Poly1305;
use poly1305::universal_hash::KeyInit;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

// ── Kinds ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumType {
    #[default]
    None,
    Crc32c,
    Crc64,
    Xxhash64,
    /// Authenticated: ChaCha20 encryption with a Poly1305 MAC over the
    /// ciphertext.
    Chacha20Poly1305,
}

impl ChecksumType {
    /// Whether payloads with this checksum type are encrypted.
    #[must_use]
    pub fn is_encryption(self) -> bool {
        matches!(self, Self::Chacha20Poly1305)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Gzip,
}

impl CompressionType {
    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }
}

/// A checksum value. Narrow checksums occupy `lo`; Poly1305 tags use both
/// halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub lo: u64,
    pub hi: u64,
}

impl Checksum {
    #[must_use]
    pub fn as_u128(self) -> u128 {
        (u128::from(self.hi) << 64) | u128::from(self.lo)
    }
}

/// Symmetric key for ChaCha20 / Poly1305.
#[derive(Clone)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

// ── CRC descriptors ─────────────────────────────────────────────────────────

/// Describes how an extent's stored bytes relate to its plaintext.
///
/// All sizes are in sectors. The stored coverage is `compressed_size`
/// sectors of (possibly compressed, possibly encrypted) data representing
/// `uncompressed_size` sectors of plaintext; the live range is
/// `[offset, offset + live_size)` within that plaintext. `nonce` is the
/// keystream sector offset of the start of the coverage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcDescriptor {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub live_size: u32,
    pub offset: u32,
    pub nonce: u32,
    pub csum_type: ChecksumType,
    pub compression_type: CompressionType,
    pub csum: Checksum,
}

impl CrcDescriptor {
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        !self.compression_type.is_none()
    }

    /// Whether a tighter checksum could replace this one: checksummed,
    /// uncompressed, and covering more than its live range.
    #[must_use]
    pub fn can_narrow(&self) -> bool {
        !self.csum_type.is_none()
            && !self.is_compressed()
            && (self.offset != 0 || self.live_size != self.uncompressed_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.live_size > self.uncompressed_size
            || self
                .offset
                .checked_add(self.live_size)
                .is_none_or(|end| end > self.uncompressed_size)
        {
            return Err(DfsError::KeyUnpack(format!(
                "bad crc descriptor: live {} offset {} uncompressed {}",
                self.live_size, self.offset, self.uncompressed_size
            )));
        }
        Ok(())
    }
}

// ── Nonces ──────────────────────────────────────────────────────────────────

/// Keystream position of a byte range: the extent version selects the IV,
/// `bytes` is the offset into that version's keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentNonce {
    pub version: Version,
    pub bytes: u64,
}

impl ExtentNonce {
    /// Nonce of the start of a descriptor's stored coverage.
    #[must_use]
    pub fn from_crc(version: Version, crc: &CrcDescriptor) -> Self {
        Self {
            version,
            bytes: u64::from(crc.nonce) * SECTOR_SIZE as u64,
        }
    }

    #[must_use]
    pub fn add_sectors(self, sectors: u32) -> Self {
        Self {
            version: self.version,
            bytes: self.bytes + u64::from(sectors) * SECTOR_SIZE as u64,
        }
    }

    #[must_use]
    pub fn add_bytes(self, bytes: u64) -> Self {
        Self {
            version: self.version,
            bytes: self.bytes + bytes,
        }
    }
}

/// IV domain tags. Data and MAC-key derivation must never share keystream.
const IV_DOMAIN_DATA: u32 = 0;
const IV_DOMAIN_POLY: u32 = 0x8000_0000;

fn version_iv(version: Version, domain: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&version.lo.to_le_bytes());
    iv[8..].copy_from_slice(&(version.hi | domain).to_le_bytes());
    iv
}

fn keystream(key: &EncryptionKey, iv: [u8; 12], offset: u64) -> Result<ChaCha20> {
    let mut cipher = ChaCha20::new(&key.0.into(), &iv.into());
    cipher
        .try_seek(offset)
        .map_err(|_| DfsError::KeyUnpack("keystream offset out of range".into()))?;
    Ok(cipher)
}

/// Derive the one-time Poly1305 key for a MAC at this nonce.
///
/// Each sector offset gets a disjoint 32-byte window of the poly-domain
/// keystream, so MAC keys are one-time per (version, nonce).
fn poly_key(key: &EncryptionKey, nonce: ExtentNonce) -> Result<[u8; 32]> {
    debug_assert!(nonce.bytes % SECTOR_SIZE as u64 == 0);
    let window = (nonce.bytes / SECTOR_SIZE as u64) * 32;
    let mut cipher = keystream(key, version_iv(nonce.version, IV_DOMAIN_POLY), window)?;
    let mut otk = [0u8; 32];
    cipher.apply_keystream(&mut otk);
    Ok(otk)
}

// ── Checksums ───────────────────────────────────────────────────────────────

/// Checksum `data` with the given kind. For `Chacha20Poly1305` this is a MAC
/// over the ciphertext, keyed per (version, nonce).
pub fn checksum(
    kind: ChecksumType,
    key: &EncryptionKey,
    nonce: ExtentNonce,
    data: &[u8],
) -> Result<Checksum> {
    Ok(match kind {
        ChecksumType::None => Checksum::default(),
        ChecksumType::Crc32c => Checksum {
            lo: u64::from(crc32c::crc32c(data)),
            hi: 0,
        },
        ChecksumType::Crc64 => {
            let mut digest = crc64fast_nvme::Digest::new();
            digest.write(data);
            Checksum {
                lo: digest.sum64(),
                hi: 0,
            }
        }
        ChecksumType::Xxhash64 => Checksum {
            lo: xxhash_rust::xxh64::xxh64(data, 0),
            hi: 0,
        },
        ChecksumType::Chacha20Poly1305 => {
            let otk = poly_key(key, nonce)?;
            let tag = Poly1305::new(poly1305::Key::from_slice(&otk)).compute_unpadded(data);
            let bytes: [u8; 16] = tag.into();
            Checksum {
                lo: u64::from_le_bytes(bytes[..8].try_into().unwrap_or([0; 8])),
                hi: u64::from_le_bytes(bytes[8..].try_into().unwrap_or([0; 8])),
            }
        }
    })
}

/// Verify `data` against an expected checksum, reporting the device the data
/// came from on mismatch.
pub fn verify_checksum(
    kind: ChecksumType,
    key: &EncryptionKey,
    nonce: ExtentNonce,
    data: &[u8],
    expected: Checksum,
    dev: DeviceIdx,
) -> Result<()> {
    let actual = checksum(kind, key, nonce, data)?;
    if actual != expected {
        return Err(DfsError::ChecksumMismatch {
            dev,
            expected: expected.as_u128(),
            actual: actual.as_u128(),
        });
    }
    Ok(())
}

// ── Encryption ──────────────────────────────────────────────────────────────

/// Encrypt or decrypt `buf` in place (ChaCha20 is symmetric). `nonce.bytes`
/// seeks the keystream so subranges keep per-byte nonce identity.
pub fn encrypt(
    kind: ChecksumType,
    key: &EncryptionKey,
    nonce: ExtentNonce,
    buf: &mut [u8],
) -> Result<()> {
    if !kind.is_encryption() {
        return Ok(());
    }
    let mut cipher = keystream(key, version_iv(nonce.version, IV_DOMAIN_DATA), nonce.bytes)?;
    cipher.apply_keystream(buf);
    Ok(())
}

// ── Compression ─────────────────────────────────────────────────────────────

/// Stored compressed framing: 4-byte little-endian payload length, then the
/// compressed payload, zero-padded to sector granularity.
const COMPRESS_HEADER: usize = 4;

fn pad_to_sectors(mut buf: Vec<u8>) -> Vec<u8> {
    let padded = buf.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    buf.resize(padded, 0);
    buf
}

/// Try to compress `src` with `kind`, producing a sector-padded buffer no
/// larger than `max_dst_bytes`.
///
/// Returns `None` when the data is incompressible: the output would not fit
/// `max_dst_bytes` or would not save at least one sector over `src`. The
/// caller then stores the chunk uncompressed.
#[must_use]
pub fn compress(kind: CompressionType, src: &[u8], max_dst_bytes: usize) -> Option<Vec<u8>> {
    debug_assert!(src.len() % SECTOR_SIZE == 0);
    let raw = match kind {
        CompressionType::None => return None,
        CompressionType::Lz4 => {
            let mut out = vec![0u8; lz4_flex::block::get_maximum_output_size(src.len())];
            let n = lz4_flex::block::compress_into(src, &mut out).ok()?;
            out.truncate(n);
            out
        }
        CompressionType::Gzip => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(src).ok()?;
            enc.finish().ok()?
        }
    };

    let mut framed = Vec::with_capacity(COMPRESS_HEADER + raw.len());
    framed.extend_from_slice(&u32::try_from(raw.len()).ok()?.to_le_bytes());
    framed.extend_from_slice(&raw);
    let framed = pad_to_sectors(framed);

    if framed.len() > max_dst_bytes || framed.len() >= src.len() {
        tracing::trace!(
            target: "dfs::codec",
            event = "incompressible",
            kind = ?kind,
            src_len = src.len(),
            dst_len = framed.len(),
        );
        return None;
    }
    Some(framed)
}

fn compressed_payload(src: &[u8]) -> Result<&[u8]> {
    if src.len() < COMPRESS_HEADER {
        return Err(DfsError::DecompressionFailed("short compressed frame".into()));
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    src.get(COMPRESS_HEADER..COMPRESS_HEADER + len)
        .ok_or_else(|| DfsError::DecompressionFailed("compressed frame length out of range".into()))
}

/// Decompress a stored coverage described by `crc` into a fresh buffer of
/// `crc.uncompressed_size` sectors.
pub fn decompress(crc: &CrcDescriptor, src: &[u8]) -> Result<Vec<u8>> {
    let out_len = dfs_types::sectors_to_bytes(crc.uncompressed_size);
    let payload = compressed_payload(src)?;
    let out = match crc.compression_type {
        CompressionType::None => {
            return Err(DfsError::DecompressionFailed(
                "descriptor is not compressed".into(),
            ));
        }
        CompressionType::Lz4 => {
            let mut out = vec![0u8; out_len];
            let n = lz4_flex::block::decompress_into(payload, &mut out)
                .map_err(|e| DfsError::DecompressionFailed(e.to_string()))?;
            if n != out_len {
                return Err(DfsError::DecompressionFailed(format!(
                    "lz4 produced {n} bytes, expected {out_len}"
                )));
            }
            out
        }
        CompressionType::Gzip => {
            let mut out = Vec::with_capacity(out_len);
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| DfsError::DecompressionFailed(e.to_string()))?;
            if out.len() != out_len {
                return Err(DfsError::DecompressionFailed(format!(
                    "gzip produced {} bytes, expected {out_len}",
                    out.len()
                )));
            }
            out
        }
    };
    Ok(out)
}

/// Decompress a buffer in place: on return `buf` holds the plaintext-sized
/// uncompressed coverage.
pub fn decompress_inplace(buf: &mut Vec<u8>, crc: &CrcDescriptor) -> Result<()> {
    let out = decompress(crc, buf)?;
    *buf = out;
    Ok(())
}

// ── Rechecksum ──────────────────────────────────────────────────────────────

/// Recompute a checksum over a subset of an uncompressed stored coverage
/// without touching the (possibly encrypted) bytes.
///
/// `data` must hold the full stored coverage (`old.uncompressed_size`
/// sectors). The old checksum is verified first; a mismatch here means the
/// data changed underneath us (memory corruption) and is surfaced as
/// `ChecksumMismatch`. The new descriptor covers exactly
/// `[new_offset, new_offset + new_live)` of the old coverage, with the
/// keystream identity carried through `nonce`.
pub fn rechecksum(
    data: &[u8],
    version: Version,
    old: &CrcDescriptor,
    new_offset: u32,
    new_live: u32,
    new_kind: ChecksumType,
    key: &EncryptionKey,
) -> Result<CrcDescriptor> {
    debug_assert!(!old.is_compressed());
    debug_assert!(new_offset + new_live <= old.uncompressed_size);

    let coverage = dfs_types::sectors_to_bytes(old.uncompressed_size);
    let nonce = ExtentNonce::from_crc(version, old);
    verify_checksum(
        old.csum_type,
        key,
        nonce,
        &data[..coverage],
        old.csum,
        DeviceIdx(u32::MAX),
    )?;

    // This path cannot encrypt or decrypt; if the requested kind changes the
    // encryption discipline, keep the old kind.
    let kind = if new_kind.is_encryption() == old.csum_type.is_encryption() {
        new_kind
    } else {
        old.csum_type
    };

    let start = dfs_types::sectors_to_bytes(new_offset);
    let len = dfs_types::sectors_to_bytes(new_live);
    let sub_nonce = nonce.add_sectors(new_offset);
    let csum = checksum(kind, key, sub_nonce, &data[start..start + len])?;

    Ok(CrcDescriptor {
        compressed_size: new_live,
        uncompressed_size: new_live,
        live_size: new_live,
        offset: 0,
        nonce: old.nonce + new_offset,
        csum_type: kind,
        compression_type: CompressionType::None,
        csum,
    })
}

/// Split an uncompressed, offset-normalized coverage into a front chunk of
/// `take` sectors and the remainder, verifying the old checksum once.
///
/// Used by the write pipeline when re-chunking pre-encoded data: the front
/// descriptor covers `[0, take)`, the rest covers `[take, live)`, both with
/// their keystream identity preserved.
pub fn crc_split(
    data: &[u8],
    version: Version,
    old: &CrcDescriptor,
    take: u32,
    new_kind: ChecksumType,
    key: &EncryptionKey,
) -> Result<(CrcDescriptor, CrcDescriptor)> {
    debug_assert_eq!(old.offset, 0);
    debug_assert_eq!(old.live_size, old.uncompressed_size);
    let front = rechecksum(data, version, old, 0, take, new_kind, key)?;
    let rest = if take == old.live_size {
        CrcDescriptor::default()
    } else {
        // The old checksum was just verified; don't verify it again.
        let kind = if new_kind.is_encryption() == old.csum_type.is_encryption() {
            new_kind
        } else {
            old.csum_type
        };
        let start = dfs_types::sectors_to_bytes(take);
        let live = old.live_size - take;
        let len = dfs_types::sectors_to_bytes(live);
        let nonce = ExtentNonce::from_crc(version, old).add_sectors(take);
        let csum = checksum(kind, key, nonce, &data[start..start + len])?;
        CrcDescriptor {
            compressed_size: live,
            uncompressed_size: live,
            live_size: live,
            offset: 0,
            nonce: old.nonce + take,
            csum_type: kind,
            compression_type: CompressionType::None,
            csum,
        }
    };
    Ok((front, rest))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> EncryptionKey {
        EncryptionKey([7u8; 32])
    }

    fn version(lo: u64) -> Version {
        Version { hi: 0, lo }
    }

    fn sectors(n: usize, fill: impl Fn(usize) -> u8) -> Vec<u8> {
        (0..n * SECTOR_SIZE).map(fill).collect()
    }

    #[test]
    fn checksum_kinds_differ_and_match() {
        let data = sectors(4, |i| (i % 251) as u8);
        let nonce = ExtentNonce {
            version: version(1),
            bytes: 0,
        };
        for kind in [
            ChecksumType::Crc32c,
            ChecksumType::Crc64,
            ChecksumType::Xxhash64,
            ChecksumType::Chacha20Poly1305,
        ] {
            let a = checksum(kind, &key(), nonce, &data).unwrap();
            let b = checksum(kind, &key(), nonce, &data).unwrap();
            assert_eq!(a, b, "{kind:?} not deterministic");
            let mut tampered = data.clone();
            tampered[100] ^= 0xff;
            let c = checksum(kind, &key(), nonce, &tampered).unwrap();
            assert_ne!(a, c, "{kind:?} missed a flipped byte");
        }
    }

    #[test]
    fn poly_mac_is_nonce_dependent() {
        let data = sectors(2, |_| 0xAA);
        let n1 = ExtentNonce {
            version: version(1),
            bytes: 0,
        };
        let n2 = n1.add_sectors(1);
        let n3 = ExtentNonce {
            version: version(2),
            bytes: 0,
        };
        let k = key();
        let a = checksum(ChecksumType::Chacha20Poly1305, &k, n1, &data).unwrap();
        let b = checksum(ChecksumType::Chacha20Poly1305, &k, n2, &data).unwrap();
        let c = checksum(ChecksumType::Chacha20Poly1305, &k, n3, &data).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn encrypt_roundtrip_and_subrange() {
        let k = key();
        let nonce = ExtentNonce {
            version: version(9),
            bytes: 0,
        };
        let plain = sectors(4, |i| (i * 31 % 256) as u8);

        let mut whole = plain.clone();
        encrypt(ChecksumType::Chacha20Poly1305, &k, nonce, &mut whole).unwrap();
        assert_ne!(whole, plain);

        // Decrypting a subrange with a seeked nonce must match the whole-buffer
        // decryption of that range.
        let mut sub = whole[SECTOR_SIZE..3 * SECTOR_SIZE].to_vec();
        encrypt(
            ChecksumType::Chacha20Poly1305,
            &k,
            nonce.add_sectors(1),
            &mut sub,
        )
        .unwrap();
        assert_eq!(sub, plain[SECTOR_SIZE..3 * SECTOR_SIZE]);

        encrypt(ChecksumType::Chacha20Poly1305, &k, nonce, &mut whole).unwrap();
        assert_eq!(whole, plain);
    }

    #[test]
    fn distinct_versions_use_distinct_keystreams() {
        let k = key();
        let plain = sectors(1, |_| 0);
        let mut a = plain.clone();
        let mut b = plain.clone();
        encrypt(
            ChecksumType::Chacha20Poly1305,
            &k,
            ExtentNonce {
                version: version(1),
                bytes: 0,
            },
            &mut a,
        )
        .unwrap();
        encrypt(
            ChecksumType::Chacha20Poly1305,
            &k,
            ExtentNonce {
                version: version(2),
                bytes: 0,
            },
            &mut b,
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn compress_zeros_saves_sectors() {
        let src = sectors(16, |_| 0);
        for kind in [CompressionType::Lz4, CompressionType::Gzip] {
            let out = compress(kind, &src, src.len()).unwrap();
            assert!(out.len() < src.len());
            assert_eq!(out.len() % SECTOR_SIZE, 0);

            let crc = CrcDescriptor {
                compressed_size: dfs_types::bytes_to_sectors(out.len()),
                uncompressed_size: 16,
                live_size: 16,
                compression_type: kind,
                ..Default::default()
            };
            let back = decompress(&crc, &out).unwrap();
            assert_eq!(back, src);
        }
    }

    #[test]
    fn compress_incompressible_returns_none() {
        // A xorshift fill is noise enough for lz4 and gzip to give up.
        let mut state = 0x9E37_79B9_u64;
        let src: Vec<u8> = (0..8 * SECTOR_SIZE)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect();
        assert!(compress(CompressionType::Lz4, &src, src.len()).is_none());
        assert!(compress(CompressionType::Gzip, &src, src.len()).is_none());
    }

    #[test]
    fn compress_respects_dst_cap() {
        // The output is sector-padded, so a sub-sector cap can never be met
        // no matter how well the data compresses.
        let src = sectors(16, |_| 0);
        assert!(compress(CompressionType::Lz4, &src, SECTOR_SIZE - 1).is_none());
        assert!(compress(CompressionType::Lz4, &src, SECTOR_SIZE).is_some());
    }

    #[test]
    fn decompress_rejects_truncated_frame() {
        let src = sectors(8, |_| 0);
        let out = compress(CompressionType::Lz4, &src, src.len()).unwrap();
        let crc = CrcDescriptor {
            compressed_size: dfs_types::bytes_to_sectors(out.len()),
            uncompressed_size: 8,
            live_size: 8,
            compression_type: CompressionType::Lz4,
            ..Default::default()
        };
        let err = decompress(&crc, &out[..2]).unwrap_err();
        assert!(matches!(err, DfsError::DecompressionFailed(_)));
    }

    #[test]
    fn rechecksum_narrows_coverage() {
        let k = key();
        let v = version(3);
        let data = sectors(8, |i| (i % 241) as u8);
        let old = CrcDescriptor {
            compressed_size: 8,
            uncompressed_size: 8,
            live_size: 8,
            csum_type: ChecksumType::Crc32c,
            csum: checksum(
                ChecksumType::Crc32c,
                &k,
                ExtentNonce {
                    version: v,
                    bytes: 0,
                },
                &data,
            )
            .unwrap(),
            ..Default::default()
        };

        let new = rechecksum(&data, v, &old, 2, 4, ChecksumType::Crc32c, &k).unwrap();
        assert_eq!(new.uncompressed_size, 4);
        assert_eq!(new.live_size, 4);
        assert_eq!(new.offset, 0);
        assert_eq!(new.nonce, 2);

        let sub = &data[2 * SECTOR_SIZE..6 * SECTOR_SIZE];
        verify_checksum(
            new.csum_type,
            &k,
            ExtentNonce::from_crc(v, &new),
            sub,
            new.csum,
            DeviceIdx(0),
        )
        .unwrap();
    }

    #[test]
    fn rechecksum_detects_corruption() {
        let k = key();
        let v = version(3);
        let data = sectors(4, |i| i as u8);
        let old = CrcDescriptor {
            compressed_size: 4,
            uncompressed_size: 4,
            live_size: 4,
            csum_type: ChecksumType::Crc32c,
            csum: Checksum { lo: 0xdead, hi: 0 },
            ..Default::default()
        };
        let err = rechecksum(&data, v, &old, 0, 2, ChecksumType::Crc32c, &k).unwrap_err();
        assert!(matches!(err, DfsError::ChecksumMismatch { .. }));
    }

    #[test]
    fn rechecksum_keeps_encryption_discipline() {
        let k = key();
        let v = version(11);
        let mut data = sectors(4, |i| (i % 13) as u8);
        let nonce = ExtentNonce {
            version: v,
            bytes: 0,
        };
        encrypt(ChecksumType::Chacha20Poly1305, &k, nonce, &mut data).unwrap();
        let old = CrcDescriptor {
            compressed_size: 4,
            uncompressed_size: 4,
            live_size: 4,
            csum_type: ChecksumType::Chacha20Poly1305,
            csum: checksum(ChecksumType::Chacha20Poly1305, &k, nonce, &data).unwrap(),
            ..Default::default()
        };
        // Asking for crc32c must not silently drop the MAC: the data is
        // ciphertext and this path cannot decrypt.
        let new = rechecksum(&data, v, &old, 1, 2, ChecksumType::Crc32c, &k).unwrap();
        assert_eq!(new.csum_type, ChecksumType::Chacha20Poly1305);
    }

    #[test]
    fn crc_split_covers_both_halves() {
        let k = key();
        let v = version(5);
        let data = sectors(6, |i| (i % 29) as u8);
        let old = CrcDescriptor {
            compressed_size: 6,
            uncompressed_size: 6,
            live_size: 6,
            csum_type: ChecksumType::Crc64,
            csum: checksum(
                ChecksumType::Crc64,
                &k,
                ExtentNonce {
                    version: v,
                    bytes: 0,
                },
                &data,
            )
            .unwrap(),
            ..Default::default()
        };
        let (front, rest) = crc_split(&data, v, &old, 2, ChecksumType::Crc64, &k).unwrap();
        assert_eq!(front.live_size, 2);
        assert_eq!(rest.live_size, 4);
        assert_eq!(rest.nonce, 2);

        verify_checksum(
            front.csum_type,
            &k,
            ExtentNonce::from_crc(v, &front),
            &data[..2 * SECTOR_SIZE],
            front.csum,
            DeviceIdx(0),
        )
        .unwrap();
        verify_checksum(
            rest.csum_type,
            &k,
            ExtentNonce::from_crc(v, &rest),
            &data[2 * SECTOR_SIZE..],
            rest.csum,
            DeviceIdx(0),
        )
        .unwrap();
    }

    proptest! {
        #[test]
        fn prop_compress_roundtrip(
            seed in 0u64..1000,
            nsec in 1usize..32,
            kind in prop_oneof![Just(CompressionType::Lz4), Just(CompressionType::Gzip)],
        ) {
            // Runs of repeated bytes: compressible but irregular.
            let mut state = seed.wrapping_mul(0x2545_F491_4F6C_DD1D) | 1;
            let mut src = Vec::with_capacity(nsec * SECTOR_SIZE);
            while src.len() < nsec * SECTOR_SIZE {
                state ^= state << 13;
                state ^= state >> 7;
                let run = (state % 200 + 8) as usize;
                let byte = (state >> 32 & 0xff) as u8;
                for _ in 0..run.min(nsec * SECTOR_SIZE - src.len()) {
                    src.push(byte);
                }
            }
            if let Some(out) = compress(kind, &src, src.len()) {
                let crc = CrcDescriptor {
                    compressed_size: dfs_types::bytes_to_sectors(out.len()),
                    uncompressed_size: dfs_types::bytes_to_sectors(src.len()),
                    live_size: dfs_types::bytes_to_sectors(src.len()),
                    compression_type: kind,
                    ..Default::default()
                };
                prop_assert_eq!(decompress(&crc, &out).unwrap(), src);
            }
        }

        #[test]
        fn prop_encrypt_seek_consistency(off in 0u32..16, len in 1usize..8) {
            let k = key();
            let v = version(77);
            let total = (off as usize + len) * SECTOR_SIZE;
            let plain: Vec<u8> = (0..total).map(|i| (i % 255) as u8).collect();
            let nonce = ExtentNonce { version: v, bytes: 0 };

            let mut whole = plain.clone();
            encrypt(ChecksumType::Chacha20Poly1305, &k, nonce, &mut whole).unwrap();

            let start = off as usize * SECTOR_SIZE;
            let mut sub = plain[start..].to_vec();
            encrypt(ChecksumType::Chacha20Poly1305, &k, nonce.add_sectors(off), &mut sub).unwrap();
            prop_assert_eq!(&whole[start..], &sub[..]);
        }
    }
}
