//! Entry framing and digests.
//!
//! Every entry travels to bookies as a sealed frame:
//!
//! ```text
//! ┌───────────┬──────────┬─────────┬───────────────┬────────┬─────────┐
//! │ ledger_id │ entry_id │   lac   │ ledger_length │ digest │ payload │
//! │  i64 BE   │  i64 BE  │ i64 BE  │    i64 BE     │ 0..32  │  bytes  │
//! └───────────┴──────────┴─────────┴───────────────┴────────┴─────────┘
//! ```
//!
//! The digest covers the 32-byte header and the payload, so a frame replayed
//! under another entry id or ledger fails verification. Its width depends on
//! the [`DigestType`]: 8 bytes for CRC-32, 4 for CRC-32C, 32 for the
//! HMAC-SHA256 `Mac` kind and none for `Dummy`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use quorumlog_cluster::{DigestType, LedgerId};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 32;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SHA256_BLOCK_LEN: usize = 64;

const MAC_KEY_PREFIX: &[u8] = b"mac";

const MASTER_KEY_PREFIX: &[u8] = b"ledger";

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// The frame is shorter than its header and digest.
    #[error("frame of {len} bytes is too short")]
    Truncated {
        /// Length of the rejected frame.
        len: usize,
    },

    /// The frame belongs to another ledger.
    #[error("frame carries ledger {actual}, expected {expected}")]
    LedgerMismatch {
        /// Ledger the manager was created for.
        expected: LedgerId,
        /// Ledger found in the frame.
        actual: LedgerId,
    },

    /// The frame carries another entry id than the one requested.
    #[error("frame carries entry {actual}, expected {expected}")]
    EntryMismatch {
        /// Entry that was requested.
        expected: i64,
        /// Entry found in the frame.
        actual: i64,
    },

    /// The stored digest does not match the recomputed one.
    #[error("digest mismatch on entry {entry_id}")]
    Mismatch {
        /// Entry id found in the frame.
        entry_id: i64,
    },
}

/// A frame that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEntry {
    /// Entry id carried by the frame.
    pub entry_id: i64,
    /// Last-add-confirmed piggybacked by the writer.
    pub last_add_confirmed: i64,
    /// Ledger length after this entry.
    pub ledger_length: u64,
    /// Payload, sharing the frame's buffer.
    pub payload: Bytes,
}

enum Algorithm {
    Crc32,
    Crc32c,
    Mac { key: Zeroizing<[u8; 32]> },
    Dummy,
}

/// Seals and verifies the frames of one ledger.
pub struct DigestManager {
    ledger_id: LedgerId,
    digest_type: DigestType,
    algorithm: Algorithm,
}

impl std::fmt::Debug for DigestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestManager")
            .field("ledger_id", &self.ledger_id)
            .field("digest_type", &self.digest_type)
            .finish_non_exhaustive()
    }
}

impl DigestManager {
    /// Creates a manager for `ledger_id`, keyed by `password` for the `Mac` kind.
    pub fn new(ledger_id: LedgerId, digest_type: DigestType, password: &[u8]) -> Self {
        let algorithm = match digest_type {
            DigestType::Crc32 => Algorithm::Crc32,
            DigestType::Crc32c => Algorithm::Crc32c,
            DigestType::Mac => Algorithm::Mac { key: derive_key(MAC_KEY_PREFIX, password) },
            DigestType::Dummy => Algorithm::Dummy,
        };
        Self { ledger_id, digest_type, algorithm }
    }

    /// Derives the master key presented to bookies with every add.
    #[must_use]
    pub fn generate_master_key(password: &[u8]) -> Bytes {
        Bytes::copy_from_slice(derive_key(MASTER_KEY_PREFIX, password).as_slice())
    }

    /// The ledger this manager seals frames for.
    #[must_use]
    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    /// The digest kind in use.
    #[must_use]
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    /// Width of the digest field in bytes.
    #[must_use]
    pub fn digest_len(&self) -> usize {
        match self.algorithm {
            Algorithm::Crc32 => 8,
            Algorithm::Crc32c => 4,
            Algorithm::Mac { .. } => 32,
            Algorithm::Dummy => 0,
        }
    }

    /// Seals `payload` as entry `entry_id`, piggybacking `lac` and the ledger
    /// length after this entry.
    #[must_use]
    pub fn compute_digest_and_package(
        &self,
        entry_id: i64,
        lac: i64,
        ledger_length: u64,
        payload: &[u8],
    ) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.digest_len() + payload.len());
        frame.put_i64(self.ledger_id.0);
        frame.put_i64(entry_id);
        frame.put_i64(lac);
        frame.put_i64(i64::try_from(ledger_length).unwrap_or(i64::MAX));
        let header: [u8; HEADER_LEN] = header_bytes(&frame);
        self.put_digest(&mut frame, &header, payload);
        frame.put_slice(payload);
        frame.freeze()
    }

    /// Verifies a frame of this ledger and extracts its fields.
    ///
    /// # Errors
    ///
    /// Returns a [`DigestError`] if the frame is truncated, belongs to another
    /// ledger, or its digest does not match.
    pub fn verify(&self, frame: &Bytes) -> Result<VerifiedEntry, DigestError> {
        let digest_len = self.digest_len();
        if frame.len() < HEADER_LEN + digest_len {
            return Err(DigestError::Truncated { len: frame.len() });
        }

        let mut header = &frame[..HEADER_LEN];
        let ledger_id = LedgerId::from(header.get_i64());
        let entry_id = header.get_i64();
        let last_add_confirmed = header.get_i64();
        let ledger_length = u64::try_from(header.get_i64()).unwrap_or(0);
        if ledger_id != self.ledger_id {
            return Err(DigestError::LedgerMismatch { expected: self.ledger_id, actual: ledger_id });
        }

        let stored = &frame[HEADER_LEN..HEADER_LEN + digest_len];
        let payload = frame.slice(HEADER_LEN + digest_len..);
        let mut expected = BytesMut::with_capacity(digest_len);
        self.put_digest(&mut expected, &header_bytes(&frame[..HEADER_LEN]), &payload);
        if !constant_time_eq(stored, &expected) {
            return Err(DigestError::Mismatch { entry_id });
        }

        Ok(VerifiedEntry { entry_id, last_add_confirmed, ledger_length, payload })
    }

    /// Verifies a frame and checks it carries `expected_entry_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::EntryMismatch`] for a frame of another entry,
    /// or any error of [`verify`](Self::verify).
    pub fn verify_entry(
        &self,
        expected_entry_id: i64,
        frame: &Bytes,
    ) -> Result<VerifiedEntry, DigestError> {
        let entry = self.verify(frame)?;
        if entry.entry_id != expected_entry_id {
            return Err(DigestError::EntryMismatch {
                expected: expected_entry_id,
                actual: entry.entry_id,
            });
        }
        Ok(entry)
    }

    fn put_digest(&self, out: &mut BytesMut, header: &[u8; HEADER_LEN], payload: &[u8]) {
        match &self.algorithm {
            Algorithm::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(header);
                hasher.update(payload);
                out.put_u64(u64::from(hasher.finalize()));
            },
            Algorithm::Crc32c => {
                let mut digest = CASTAGNOLI.digest();
                digest.update(header);
                digest.update(payload);
                out.put_u32(digest.finalize());
            },
            Algorithm::Mac { key } => {
                out.put_slice(&hmac_sha256(key.as_slice(), &[header, payload]));
            },
            Algorithm::Dummy => {},
        }
    }
}

fn header_bytes(buf: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    header
}

fn derive_key(prefix: &[u8], password: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    hasher.update(password);
    Zeroizing::new(hasher.finalize().into())
}

/// HMAC-SHA256 (RFC 2104) over the concatenation of `parts`.
fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut block = Zeroizing::new([0u8; SHA256_BLOCK_LEN]);
    if key.len() > SHA256_BLOCK_LEN {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update((*block).map(|b| b ^ 0x36));
    for part in parts {
        inner.update(part);
    }
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update((*block).map(|b| b ^ 0x5c));
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    const LEDGER: LedgerId = LedgerId(17);

    #[rstest]
    #[case::crc32(DigestType::Crc32, 8)]
    #[case::crc32c(DigestType::Crc32c, 4)]
    #[case::mac(DigestType::Mac, 32)]
    #[case::dummy(DigestType::Dummy, 0)]
    fn sealed_frame_verifies(#[case] digest_type: DigestType, #[case] digest_len: usize) {
        let manager = DigestManager::new(LEDGER, digest_type, b"secret");
        let frame = manager.compute_digest_and_package(3, 2, 40, b"payload");

        assert_eq!(frame.len(), HEADER_LEN + digest_len + 7);
        let entry = manager.verify_entry(3, &frame).unwrap();
        assert_eq!(entry.entry_id, 3);
        assert_eq!(entry.last_add_confirmed, 2);
        assert_eq!(entry.ledger_length, 40);
        assert_eq!(entry.payload, Bytes::from_static(b"payload"));
    }

    #[rstest]
    #[case::crc32(DigestType::Crc32)]
    #[case::crc32c(DigestType::Crc32c)]
    #[case::mac(DigestType::Mac)]
    fn corrupted_payload_is_rejected(#[case] digest_type: DigestType) {
        let manager = DigestManager::new(LEDGER, digest_type, b"secret");
        let frame = manager.compute_digest_and_package(0, -1, 4, b"data");
        let mut corrupted = frame.to_vec();
        *corrupted.last_mut().unwrap() ^= 0x01;

        let err = manager.verify(&Bytes::from(corrupted)).unwrap_err();
        assert_eq!(err, DigestError::Mismatch { entry_id: 0 });
    }

    #[rstest]
    #[case::crc32(DigestType::Crc32)]
    #[case::mac(DigestType::Mac)]
    fn rewritten_entry_id_is_rejected(#[case] digest_type: DigestType) {
        let manager = DigestManager::new(LEDGER, digest_type, b"secret");
        let frame = manager.compute_digest_and_package(5, 4, 10, b"data");
        let mut replayed = frame.to_vec();
        replayed[8..16].copy_from_slice(&6i64.to_be_bytes());

        let err = manager.verify(&Bytes::from(replayed)).unwrap_err();
        assert_eq!(err, DigestError::Mismatch { entry_id: 6 });
    }

    #[test]
    fn dummy_still_checks_identity() {
        let manager = DigestManager::new(LEDGER, DigestType::Dummy, b"");
        let frame = manager.compute_digest_and_package(1, 0, 2, b"xy");

        let err = manager.verify_entry(2, &frame).unwrap_err();
        assert_eq!(err, DigestError::EntryMismatch { expected: 2, actual: 1 });

        let other = DigestManager::new(LedgerId::from(18), DigestType::Dummy, b"");
        let err = other.verify(&frame).unwrap_err();
        assert!(matches!(err, DigestError::LedgerMismatch { .. }));
    }

    #[test]
    fn mac_depends_on_password() {
        let writer = DigestManager::new(LEDGER, DigestType::Mac, b"right");
        let reader = DigestManager::new(LEDGER, DigestType::Mac, b"wrong");
        let frame = writer.compute_digest_and_package(0, -1, 4, b"data");

        assert!(matches!(reader.verify(&frame), Err(DigestError::Mismatch { .. })));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let manager = DigestManager::new(LEDGER, DigestType::Crc32, b"");
        let err = manager.verify(&Bytes::from_static(&[0u8; 12])).unwrap_err();
        assert_eq!(err, DigestError::Truncated { len: 12 });
    }

    #[test]
    fn empty_payload_round_trips() {
        let manager = DigestManager::new(LEDGER, DigestType::Crc32c, b"");
        let frame = manager.compute_digest_and_package(0, -1, 0, b"");
        assert!(manager.verify(&frame).unwrap().payload.is_empty());
    }

    #[test]
    fn master_key_is_deterministic_and_password_bound() {
        let a = DigestManager::generate_master_key(b"pw");
        let b = DigestManager::generate_master_key(b"pw");
        let c = DigestManager::generate_master_key(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        let expected: [u8; 32] = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(mac, expected);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Any payload sealed under any entry id verifies under the same id.
            #[test]
            fn seal_then_verify(
                payload in proptest::collection::vec(any::<u8>(), 0..512),
                entry_id in 0..i64::MAX,
                lac in -1..i64::MAX,
            ) {
                let manager = DigestManager::new(LEDGER, DigestType::Crc32c, b"pw");
                let frame = manager.compute_digest_and_package(entry_id, lac, payload.len() as u64, &payload);
                let entry = manager.verify_entry(entry_id, &frame).unwrap();
                prop_assert_eq!(entry.payload.as_ref(), payload.as_slice());
                prop_assert_eq!(entry.last_add_confirmed, lac);
            }
        }
    }
}
