//! EIP-4844 blob data encoding (OP version 0).
//!
//! Each 32-byte field element carries 31 data bytes plus 6 bits packed into its top byte, so
//! four field elements carry 127 bytes. The first field element starts with the encoding version
//! and a 3-byte big-endian payload length.

use alloy_eips::eip4844::{Blob, BYTES_PER_BLOB};

/// Maximum payload of one blob: (4 * 31 + 3) * 1024 - 4.
pub const BLOB_MAX_DATA_SIZE: usize = 130_044;

/// Number of 4-field-element rounds in a blob.
const BLOB_ENCODING_ROUNDS: usize = 1024;

/// Encoding version stored in byte 1 of the blob.
pub const BLOB_ENCODING_VERSION: u8 = 0;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("data too large for blob: {0} > {BLOB_MAX_DATA_SIZE}")]
    TooLarge(usize),
    #[error("unsupported blob encoding version {0}")]
    UnknownVersion(u8),
    #[error("invalid blob length {0}")]
    InvalidLength(usize),
    #[error("field element {0} has high bits set")]
    InvalidFieldElement(usize),
    #[error("non-zero data past payload length")]
    ExtraneousData,
}

struct Writer<'a> {
    blob: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn field_element(&mut self, high: u8, body: &[u8; 31]) {
        self.blob[self.pos] = high;
        self.blob[self.pos + 1..self.pos + 32].copy_from_slice(body);
        self.pos += 32;
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> u8 {
        let b = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    fn chunk31(&mut self, out: &mut [u8; 31]) {
        *out = [0u8; 31];
        if self.pos < self.data.len() {
            let n = (self.data.len() - self.pos).min(31);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        }
        self.pos += 31;
    }
}

/// Encode `data` into a single blob.
pub fn encode_blob(data: &[u8]) -> Result<Box<Blob>, BlobError> {
    if data.len() > BLOB_MAX_DATA_SIZE {
        return Err(BlobError::TooLarge(data.len()));
    }

    let mut blob = Box::new(Blob::ZERO);
    let mut w = Writer { blob: blob.as_mut_slice(), pos: 0 };
    let mut r = Reader { data, pos: 0 };
    let mut buf = [0u8; 31];

    for round in 0..BLOB_ENCODING_ROUNDS {
        if r.pos >= data.len() {
            break;
        }
        if round == 0 {
            let len = data.len() as u32;
            buf = [0u8; 31];
            buf[0] = BLOB_ENCODING_VERSION;
            buf[1..4].copy_from_slice(&len.to_be_bytes()[1..]);
            let n = data.len().min(27);
            buf[4..4 + n].copy_from_slice(&data[..n]);
            r.pos = 27;
        } else {
            r.chunk31(&mut buf);
        }

        let x = r.byte();
        w.field_element(x & 0b0011_1111, &buf);

        r.chunk31(&mut buf);
        let y = r.byte();
        w.field_element((y & 0b0000_1111) | ((x & 0b1100_0000) >> 2), &buf);

        r.chunk31(&mut buf);
        let z = r.byte();
        w.field_element(z & 0b0011_1111, &buf);

        r.chunk31(&mut buf);
        w.field_element(((z & 0b1100_0000) >> 2) | ((y & 0b1111_0000) >> 4), &buf);
    }

    Ok(blob)
}

/// Split `data` into as many blobs as needed.
pub fn encode_blobs(data: &[u8]) -> Result<Vec<Box<Blob>>, BlobError> {
    data.chunks(BLOB_MAX_DATA_SIZE).map(encode_blob).collect()
}

/// Decode the payload of a blob.
pub fn decode_blob(blob: &Blob) -> Result<Vec<u8>, BlobError> {
    let data: &[u8] = blob.as_ref();
    debug_assert_eq!(data.len(), BYTES_PER_BLOB);

    if data[1] != BLOB_ENCODING_VERSION {
        return Err(BlobError::UnknownVersion(data[1]));
    }
    let length = u32::from_be_bytes([0, data[2], data[3], data[4]]) as usize;
    if length > BLOB_MAX_DATA_SIZE {
        return Err(BlobError::InvalidLength(length));
    }

    // Room for the whole last round, trimmed to `length` at the end.
    let mut out = vec![0u8; BLOB_MAX_DATA_SIZE + 4];
    let mut ipos = 0;
    let mut opos = 0;
    let mut round = 0;

    // Byte 0..4 of the first element hold version and length, not payload.
    while round < BLOB_ENCODING_ROUNDS && (round == 0 || opos < length) {
        let mut high = [0u8; 4];
        for (k, h) in high.iter_mut().enumerate() {
            let fe = &data[ipos..ipos + 32];
            if fe[0] & 0b1100_0000 != 0 {
                return Err(BlobError::InvalidFieldElement(ipos / 32));
            }
            *h = fe[0];
            if round == 0 && k == 0 {
                out[0..27].copy_from_slice(&fe[5..32]);
                opos = 28;
            } else {
                out[opos..opos + 31].copy_from_slice(&fe[1..32]);
                opos += 32;
            }
            ipos += 32;
        }
        // The last output slot of each element is filled from the packed high bits.
        let x = (high[0] & 0b0011_1111) | ((high[1] & 0b0011_0000) << 2);
        let y = (high[1] & 0b0000_1111) | ((high[3] & 0b0000_1111) << 4);
        let z = (high[2] & 0b0011_1111) | ((high[3] & 0b0011_0000) << 2);
        opos -= 1;
        out[opos - 96] = x;
        out[opos - 64] = y;
        out[opos - 32] = z;
        round += 1;
    }

    if out[length..opos].iter().any(|b| *b != 0) || data[ipos..].iter().any(|b| *b != 0) {
        return Err(BlobError::ExtraneousData);
    }
    out.truncate(length);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    use super::*;

    #[test]
    fn test_roundtrip_sizes() {
        let mut rng = StdRng::seed_from_u64(44);
        for len in [0usize, 1, 27, 28, 127, 128, 1000, 20_000, BLOB_MAX_DATA_SIZE] {
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            let blob = encode_blob(&data).unwrap();
            assert_eq!(decode_blob(&blob).unwrap(), data, "len {len}");
        }
    }

    #[test]
    fn test_header_layout() {
        let blob = encode_blob(&[0xff; 300]).unwrap();
        assert_eq!(blob[1], BLOB_ENCODING_VERSION);
        assert_eq!(&blob[2..5], &[0, 1, 44]);
        // Every field element keeps its top two bits clear.
        assert!(blob.chunks(32).all(|fe| fe[0] & 0b1100_0000 == 0));
    }

    #[test]
    fn test_too_large() {
        assert_eq!(
            encode_blob(&vec![0u8; BLOB_MAX_DATA_SIZE + 1]).unwrap_err(),
            BlobError::TooLarge(BLOB_MAX_DATA_SIZE + 1)
        );
    }

    #[test]
    fn test_rejects_bad_field_element() {
        let mut blob = encode_blob(b"hello").unwrap();
        blob[64] = 0x80;
        assert!(matches!(decode_blob(&blob), Err(BlobError::InvalidFieldElement(_)) | Err(BlobError::ExtraneousData)));
        let mut blob = encode_blob(b"hello").unwrap();
        blob[1] = 1;
        assert_eq!(decode_blob(&blob), Err(BlobError::UnknownVersion(1)));
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        let mut blob = encode_blob(b"hello").unwrap();
        blob[BYTES_PER_BLOB - 1] = 1;
        assert_eq!(decode_blob(&blob), Err(BlobError::ExtraneousData));
    }
}
