//! Columnar transaction encoding of span batches.
//!
//! ```text
//! contract_creation_bits ‖ y_parity_bits ‖ tx_sigs ‖ tx_tos ‖ tx_datas ‖ tx_nonces ‖ tx_gases
//!   ‖ protected_bits
//! ```
//! Bitlists are big-endian integers left-padded to a byte boundary; bit `i` counts from the least
//! significant bit. `tx_datas` hold the type byte (if any) followed by the RLP list of the fields
//! not carried elsewhere, with `value` first.

use alloy_consensus::{
    SignableTransaction, TxEip1559, TxEip2930, TxEip7702, TxEnvelope, TxLegacy,
};
use alloy_eips::{
    eip2718::{Decodable2718, Encodable2718},
    eip2930::AccessList,
    eip7702::SignedAuthorization,
};
use alloy_primitives::{Address, Bytes, Signature, TxKind, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};

use super::BatchError;

#[derive(RlpEncodable, RlpDecodable)]
struct LegacyFields {
    value: U256,
    gas_price: u128,
    data: Bytes,
}

#[derive(RlpEncodable, RlpDecodable)]
struct Eip2930Fields {
    value: U256,
    gas_price: u128,
    data: Bytes,
    access_list: AccessList,
}

#[derive(RlpEncodable, RlpDecodable)]
struct Eip1559Fields {
    value: U256,
    max_priority_fee_per_gas: u128,
    max_fee_per_gas: u128,
    data: Bytes,
    access_list: AccessList,
}

#[derive(RlpEncodable, RlpDecodable)]
struct Eip7702Fields {
    value: U256,
    max_priority_fee_per_gas: u128,
    max_fee_per_gas: u128,
    data: Bytes,
    access_list: AccessList,
    authorization_list: Vec<SignedAuthorization>,
}

/// Type-specific part of a span batch transaction.
enum TxData {
    Legacy(LegacyFields),
    Eip2930(Eip2930Fields),
    Eip1559(Eip1559Fields),
    Eip7702(Eip7702Fields),
}

impl TxData {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Legacy(f) => f.encode(out),
            Self::Eip2930(f) => {
                out.push(0x01);
                f.encode(out);
            }
            Self::Eip1559(f) => {
                out.push(0x02);
                f.encode(out);
            }
            Self::Eip7702(f) => {
                out.push(0x04);
                f.encode(out);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, BatchError> {
        let first = *buf.first().ok_or(BatchError::BufferTooShort("tx_datas"))?;
        let data = match first {
            0x01 => {
                *buf = &buf[1..];
                Self::Eip2930(Eip2930Fields::decode(buf)?)
            }
            0x02 => {
                *buf = &buf[1..];
                Self::Eip1559(Eip1559Fields::decode(buf)?)
            }
            0x04 => {
                *buf = &buf[1..];
                Self::Eip7702(Eip7702Fields::decode(buf)?)
            }
            b if b >= 0xc0 => Self::Legacy(LegacyFields::decode(buf)?),
            other => return Err(BatchError::UnsupportedTxType(other)),
        };
        Ok(data)
    }
}

/// Decomposed view of one transaction.
struct SpanTx {
    to: TxKind,
    signature: Signature,
    nonce: u64,
    gas: u64,
    /// Legacy only: EIP-155 replay protection.
    protected: bool,
    data: TxData,
}

impl SpanTx {
    fn from_raw(raw: &[u8]) -> Result<Self, BatchError> {
        let mut buf = raw;
        let env = TxEnvelope::decode_2718(&mut buf)
            .map_err(|e| BatchError::InvalidTransaction(e.to_string()))?;
        let tx = match env {
            TxEnvelope::Legacy(signed) => {
                let (tx, signature, _) = signed.into_parts();
                Self {
                    to: tx.to,
                    signature,
                    nonce: tx.nonce,
                    gas: tx.gas_limit,
                    protected: tx.chain_id.is_some(),
                    data: TxData::Legacy(LegacyFields {
                        value: tx.value,
                        gas_price: tx.gas_price,
                        data: tx.input,
                    }),
                }
            }
            TxEnvelope::Eip2930(signed) => {
                let (tx, signature, _) = signed.into_parts();
                Self {
                    to: tx.to,
                    signature,
                    nonce: tx.nonce,
                    gas: tx.gas_limit,
                    protected: true,
                    data: TxData::Eip2930(Eip2930Fields {
                        value: tx.value,
                        gas_price: tx.gas_price,
                        data: tx.input,
                        access_list: tx.access_list,
                    }),
                }
            }
            TxEnvelope::Eip1559(signed) => {
                let (tx, signature, _) = signed.into_parts();
                Self {
                    to: tx.to,
                    signature,
                    nonce: tx.nonce,
                    gas: tx.gas_limit,
                    protected: true,
                    data: TxData::Eip1559(Eip1559Fields {
                        value: tx.value,
                        max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
                        max_fee_per_gas: tx.max_fee_per_gas,
                        data: tx.input,
                        access_list: tx.access_list,
                    }),
                }
            }
            TxEnvelope::Eip7702(signed) => {
                let (tx, signature, _) = signed.into_parts();
                Self {
                    to: TxKind::Call(tx.to),
                    signature,
                    nonce: tx.nonce,
                    gas: tx.gas_limit,
                    protected: true,
                    data: TxData::Eip7702(Eip7702Fields {
                        value: tx.value,
                        max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
                        max_fee_per_gas: tx.max_fee_per_gas,
                        data: tx.input,
                        access_list: tx.access_list,
                        authorization_list: tx.authorization_list,
                    }),
                }
            }
            TxEnvelope::Eip4844(_) => return Err(BatchError::UnsupportedTxType(0x03)),
        };
        Ok(tx)
    }

    fn into_raw(self, chain_id: u64) -> Result<Bytes, BatchError> {
        let sig = self.signature;
        let env: TxEnvelope = match self.data {
            TxData::Legacy(f) => TxLegacy {
                chain_id: self.protected.then_some(chain_id),
                nonce: self.nonce,
                gas_price: f.gas_price,
                gas_limit: self.gas,
                to: self.to,
                value: f.value,
                input: f.data,
            }
            .into_signed(sig)
            .into(),
            TxData::Eip2930(f) => TxEip2930 {
                chain_id,
                nonce: self.nonce,
                gas_price: f.gas_price,
                gas_limit: self.gas,
                to: self.to,
                value: f.value,
                access_list: f.access_list,
                input: f.data,
            }
            .into_signed(sig)
            .into(),
            TxData::Eip1559(f) => TxEip1559 {
                chain_id,
                nonce: self.nonce,
                gas_limit: self.gas,
                max_fee_per_gas: f.max_fee_per_gas,
                max_priority_fee_per_gas: f.max_priority_fee_per_gas,
                to: self.to,
                value: f.value,
                access_list: f.access_list,
                input: f.data,
            }
            .into_signed(sig)
            .into(),
            TxData::Eip7702(f) => {
                let TxKind::Call(to) = self.to else {
                    return Err(BatchError::InvalidTransaction("7702 contract creation".into()));
                };
                TxEip7702 {
                    chain_id,
                    nonce: self.nonce,
                    gas_limit: self.gas,
                    max_fee_per_gas: f.max_fee_per_gas,
                    max_priority_fee_per_gas: f.max_priority_fee_per_gas,
                    to,
                    value: f.value,
                    access_list: f.access_list,
                    authorization_list: f.authorization_list,
                    input: f.data,
                }
                .into_signed(sig)
                .into()
            }
        };
        Ok(Bytes::from(env.encoded_2718()))
    }

    const fn is_legacy(&self) -> bool {
        matches!(self.data, TxData::Legacy(_))
    }
}

fn bitlist_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Encode `bits` as a big-endian integer.
pub(super) fn write_bitlist(bits: &[bool], out: &mut Vec<u8>) {
    let len = bitlist_len(bits.len());
    let start = out.len();
    out.resize(start + len, 0);
    for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        out[start + len - 1 - i / 8] |= 1 << (i % 8);
    }
}

/// Decode a bitlist of `n` bits, rejecting set bits past `n`.
pub(super) fn read_bitlist(
    buf: &mut &[u8],
    n: usize,
    field: &'static str,
) -> Result<Vec<bool>, BatchError> {
    let len = bitlist_len(n);
    if buf.len() < len {
        return Err(BatchError::BufferTooShort(field));
    }
    let (raw, rest) = buf.split_at(len);
    let bit = |i: usize| raw[len - 1 - i / 8] >> (i % 8) & 1 == 1;
    if (n..len * 8).any(bit) {
        return Err(BatchError::BitlistOverflow(field));
    }
    *buf = rest;
    Ok((0..n).map(bit).collect())
}

pub(super) fn write_varint(v: u64, out: &mut Vec<u8>) {
    let mut b = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(v, &mut b));
}

pub(super) fn read_varint(buf: &mut &[u8], field: &'static str) -> Result<u64, BatchError> {
    let (v, rest) = unsigned_varint::decode::u64(buf).map_err(|_| BatchError::Varint(field))?;
    *buf = rest;
    Ok(v)
}

fn take<'a>(buf: &mut &'a [u8], n: usize, field: &'static str) -> Result<&'a [u8], BatchError> {
    if buf.len() < n {
        return Err(BatchError::BufferTooShort(field));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

/// Encode raw EIP-2718 transactions into the columnar layout.
pub(super) fn encode_txs(raw: &[Bytes], out: &mut Vec<u8>) -> Result<(), BatchError> {
    let txs = raw.iter().map(|tx| SpanTx::from_raw(tx)).collect::<Result<Vec<_>, _>>()?;

    let creation: Vec<bool> = txs.iter().map(|t| t.to.is_create()).collect();
    write_bitlist(&creation, out);
    let parity: Vec<bool> = txs.iter().map(|t| t.signature.v()).collect();
    write_bitlist(&parity, out);
    for t in &txs {
        out.extend_from_slice(&t.signature.r().to_be_bytes::<32>());
        out.extend_from_slice(&t.signature.s().to_be_bytes::<32>());
    }
    for t in &txs {
        if let TxKind::Call(to) = t.to {
            out.extend_from_slice(to.as_slice());
        }
    }
    for t in &txs {
        t.data.encode(out);
    }
    for t in &txs {
        write_varint(t.nonce, out);
    }
    for t in &txs {
        write_varint(t.gas, out);
    }
    let protected: Vec<bool> = txs.iter().filter(|t| t.is_legacy()).map(|t| t.protected).collect();
    write_bitlist(&protected, out);
    Ok(())
}

/// Decode `count` columnar transactions back into raw EIP-2718 transactions.
pub(super) fn decode_txs(
    buf: &mut &[u8],
    count: usize,
    chain_id: u64,
) -> Result<Vec<Bytes>, BatchError> {
    let creation = read_bitlist(buf, count, "contract_creation_bits")?;
    let parity = read_bitlist(buf, count, "y_parity_bits")?;

    let sigs = take(buf, count * 64, "tx_sigs")?;
    let signatures: Vec<Signature> = sigs
        .chunks_exact(64)
        .zip(&parity)
        .map(|(rs, v)| {
            Signature::new(U256::from_be_slice(&rs[..32]), U256::from_be_slice(&rs[32..]), *v)
        })
        .collect();

    let calls = creation.iter().filter(|c| !**c).count();
    let tos = take(buf, calls * 20, "tx_tos")?;
    let mut tos = tos.chunks_exact(20).map(Address::from_slice);

    let mut datas = Vec::with_capacity(count);
    for _ in 0..count {
        datas.push(TxData::decode(buf)?);
    }
    let mut nonces = Vec::with_capacity(count);
    for _ in 0..count {
        nonces.push(read_varint(buf, "tx_nonces")?);
    }
    let mut gases = Vec::with_capacity(count);
    for _ in 0..count {
        gases.push(read_varint(buf, "tx_gases")?);
    }
    let legacy = datas.iter().filter(|d| matches!(d, TxData::Legacy(_))).count();
    let mut protected = read_bitlist(buf, legacy, "protected_bits")?.into_iter();

    let mut out = Vec::with_capacity(count);
    for (i, data) in datas.into_iter().enumerate() {
        let to = if creation[i] {
            TxKind::Create
        } else {
            TxKind::Call(tos.next().ok_or(BatchError::BufferTooShort("tx_tos"))?)
        };
        let is_legacy = matches!(data, TxData::Legacy(_));
        let tx = SpanTx {
            to,
            signature: signatures[i],
            nonce: nonces[i],
            gas: gases[i],
            protected: if is_legacy { protected.next().unwrap_or(false) } else { true },
            data,
        };
        out.push(tx.into_raw(chain_id)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitlist_is_big_endian_integer() {
        let mut out = Vec::new();
        let mut bits = vec![false; 10];
        bits[0] = true;
        bits[9] = true;
        write_bitlist(&bits, &mut out);
        assert_eq!(out, vec![0b0000_0010, 0b0000_0001]);
        let mut buf = out.as_slice();
        assert_eq!(read_bitlist(&mut buf, 10, "t").unwrap(), bits);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bitlist_overflow_rejected() {
        let raw = [0b1000_0000u8];
        let mut buf = &raw[..];
        assert_eq!(read_bitlist(&mut buf, 3, "t"), Err(BatchError::BitlistOverflow("t")));
    }
}
