use std::collections::BTreeMap;

use super::HeaderError;
use super::consts::{SIZE_RANGE, TAR_RECORD_SIZE, TYPE_PAX_EXTENDED, TYPEFLAG_OFFSET, round_to_record};
use super::tar::{ClassicHeader, check_magic, parse_octal, verify_record};

/// POSIX extended header: an `x` record, its key/value payload, then the ustar record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub records: BTreeMap<String, String>,
    pub entry: ClassicHeader,
}

impl ExtendedHeader {
    pub fn new(entry: ClassicHeader) -> Self {
        let mut records = BTreeMap::new();
        records.insert("size".to_string(), entry.size.to_string());
        records.insert("path".to_string(), entry.name.clone());
        Self { records, entry }
    }

    /// Total header length declared by the fixed-size prefix.
    pub fn total_len(prefix: &[u8]) -> Result<usize, HeaderError> {
        verify_record(prefix)?;
        Self::declared_len(prefix)
    }

    /// Total length from a prefix whose record checksum is not checked.
    pub(crate) fn declared_len(prefix: &[u8]) -> Result<usize, HeaderError> {
        check_magic(prefix)?;
        if prefix[TYPEFLAG_OFFSET] != TYPE_PAX_EXTENDED {
            return Err(HeaderError::MalformedExtended("missing extended record"));
        }
        let payload = parse_octal(&prefix[SIZE_RANGE]).ok_or(HeaderError::InvalidSizeField)?;
        Ok(2 * TAR_RECORD_SIZE + round_to_record(payload) as usize)
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_records();
        let mut prefix = ClassicHeader::regular("PaxHeader", payload.len() as u64);
        prefix.typeflag = TYPE_PAX_EXTENDED;

        let padded = round_to_record(payload.len() as u64) as usize;
        let mut out = Vec::with_capacity(2 * TAR_RECORD_SIZE + padded);
        out.extend_from_slice(&prefix.to_bytes());
        out.extend_from_slice(&payload);
        out.resize(TAR_RECORD_SIZE + padded, 0);
        out.extend_from_slice(&self.entry.to_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let total = Self::total_len(bytes)?;
        if bytes.len() < total {
            return Err(HeaderError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }
        let payload_len = parse_octal(&bytes[SIZE_RANGE]).ok_or(HeaderError::InvalidSizeField)?;
        let payload = &bytes[TAR_RECORD_SIZE..TAR_RECORD_SIZE + payload_len as usize];
        let records = parse_records(payload)?;
        let entry = ClassicHeader::from_bytes(&bytes[total - TAR_RECORD_SIZE..total])?;
        Ok(Self { records, entry })
    }

    /// File size declared by the header; the `size` record overrides the ustar field.
    pub fn size(&self) -> Result<u64, HeaderError> {
        match self.records.get("size") {
            Some(raw) => raw
                .parse()
                .map_err(|_| HeaderError::MalformedExtended("size record is not a number")),
            None => Ok(self.entry.size),
        }
    }

    fn encode_records(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.records {
            let body = format!(" {key}={value}\n");
            // The length prefix counts its own digits.
            let mut len = body.len() + 1;
            while len.to_string().len() + body.len() != len {
                len = len.to_string().len() + body.len();
            }
            out.extend_from_slice(len.to_string().as_bytes());
            out.extend_from_slice(body.as_bytes());
        }
        out
    }
}

fn parse_records(mut payload: &[u8]) -> Result<BTreeMap<String, String>, HeaderError> {
    let mut records = BTreeMap::new();
    while !payload.is_empty() {
        if payload.iter().all(|b| *b == 0) {
            break;
        }
        let space = payload
            .iter()
            .position(|b| *b == b' ')
            .ok_or(HeaderError::MalformedExtended("record without length"))?;
        let len: usize = std::str::from_utf8(&payload[..space])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or(HeaderError::MalformedExtended("bad record length"))?;
        if len <= space + 1 || len > payload.len() || payload[len - 1] != b'\n' {
            return Err(HeaderError::MalformedExtended("record length out of range"));
        }
        let body = std::str::from_utf8(&payload[space + 1..len - 1])
            .map_err(|_| HeaderError::MalformedExtended("record is not utf-8"))?;
        let (key, value) = body
            .split_once('=')
            .ok_or(HeaderError::MalformedExtended("record without '='"))?;
        records.insert(key.to_string(), value.to_string());
        payload = &payload[len..];
    }
    Ok(records)
}
