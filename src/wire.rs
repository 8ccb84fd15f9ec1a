//! In-process wire payloads.
//!
//! These are the well-known binary structures carried as `AppClass`-tagged
//! binary values on the bus: the stream sample block produced by device
//! workers, and the buffer info/request/response structures exchanged with
//! the per-buffer workers. All fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ErrorCode, Result};
use crate::statistics::SummaryEntry;
use crate::time::{TimeMap, UtcTime};
use crate::topic::TOPIC_LENGTH_MAX;

/// Fixed stream block header size in bytes.
pub const STREAM_HEADER_SIZE: usize = 48;

/// Maximum stream block body size in bytes.
pub const STREAM_PAYLOAD_MAX: usize = 64 * 1024;

/// Maximum entry count for a single summary response.
pub const SUMMARY_LENGTH_MAX: u64 = 65536;

pub const BUFFER_VERSION: u8 = 1;

/// The element representation of a sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    UInt = 3,
    Float = 4,
}

impl ElementType {
    pub fn from_u8(v: u8) -> Result<ElementType> {
        match v {
            3 => Ok(ElementType::UInt),
            4 => Ok(ElementType::Float),
            _ => Err(ErrorCode::NotSupported),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            Err(ErrorCode::TooSmall)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64> {
        self.u64().map(|v| v as i64)
    }

    fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        let v = LittleEndian::read_f64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        let v = LittleEndian::read_f32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    /// u8 length-prefixed UTF-8 string.
    fn topic_str(&mut self) -> Result<String> {
        let n = self.u8()? as usize;
        if n >= TOPIC_LENGTH_MAX {
            return Err(ErrorCode::SyntaxError);
        }
        let raw = self.bytes(n)?;
        std::str::from_utf8(raw)
            .map(|s| s.to_string())
            .map_err(|_| ErrorCode::SyntaxError)
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_topic_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() >= TOPIC_LENGTH_MAX {
        return Err(ErrorCode::ParameterInvalid);
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_time_map(out: &mut Vec<u8>, tm: &TimeMap) {
    put_u64(out, tm.offset_time.q30() as u64);
    put_u64(out, tm.offset_counter);
    put_f64(out, tm.counter_rate);
}

fn read_time_map(r: &mut Reader<'_>) -> Result<TimeMap> {
    Ok(TimeMap {
        offset_time: UtcTime::from_q30(r.i64()?),
        offset_counter: r.u64()?,
        counter_rate: r.f64()?,
    })
}

/// Fixed 48-byte header of a stream sample block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamHeader {
    /// Sample id of the first sample in the block, pre-decimation.
    pub sample_id: u64,
    pub field_id: u8,
    pub index: u8,
    pub element_type: ElementType,
    pub element_size_bits: u8,
    pub element_count: u32,
    pub sample_rate: u32,
    pub decimate_factor: u32,
    pub time_map: TimeMap,
}

impl StreamHeader {
    /// Encodes the header followed by the sample payload.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + data.len());
        put_u64(&mut out, self.sample_id);
        out.push(self.field_id);
        out.push(self.index);
        out.push(self.element_type as u8);
        out.push(self.element_size_bits);
        put_u32(&mut out, self.element_count);
        put_u32(&mut out, self.sample_rate);
        put_u32(&mut out, self.decimate_factor);
        put_time_map(&mut out, &self.time_map);
        out.extend_from_slice(data);
        out
    }

    /// Parses the header and returns it with the trailing sample payload.
    pub fn parse(buf: &[u8]) -> Result<(StreamHeader, &[u8])> {
        let mut r = Reader::new(buf);
        let sample_id = r.u64()?;
        let field_id = r.u8()?;
        let index = r.u8()?;
        let element_type = ElementType::from_u8(r.u8()?)?;
        let element_size_bits = r.u8()?;
        let element_count = r.u32()?;
        let sample_rate = r.u32()?;
        let decimate_factor = r.u32()?;
        let time_map = read_time_map(&mut r)?;
        let hdr = StreamHeader {
            sample_id,
            field_id,
            index,
            element_type,
            element_size_bits,
            element_count,
            sample_rate,
            decimate_factor,
            time_map,
        };
        Ok((hdr, r.rest()))
    }
}

/// The time range of a buffer request, in either domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeRange {
    Utc {
        start: UtcTime,
        end: UtcTime,
        length: u64,
    },
    Samples {
        start: u64,
        end: u64,
        length: u64,
    },
}

/// A data request posted to `m/{id}/s/{signal_id}/!req`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferRequest {
    pub version: u8,
    pub time: TimeRange,
    pub rsp_topic: String,
    pub rsp_id: u64,
}

impl BufferRequest {
    pub fn new(time: TimeRange, rsp_topic: impl Into<String>, rsp_id: u64) -> Self {
        BufferRequest {
            version: BUFFER_VERSION,
            time,
            rsp_topic: rsp_topic.into(),
            rsp_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(self.version);
        let (time_type, a, b, length) = match self.time {
            TimeRange::Utc { start, end, length } => {
                (0u8, start.q30() as u64, end.q30() as u64, length)
            }
            TimeRange::Samples { start, end, length } => (1u8, start, end, length),
        };
        out.push(time_type);
        put_u64(&mut out, a);
        put_u64(&mut out, b);
        put_u64(&mut out, length);
        put_u64(&mut out, self.rsp_id);
        put_topic_str(&mut out, &self.rsp_topic)?;
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<BufferRequest> {
        let mut r = Reader::new(buf);
        let version = r.u8()?;
        if version != BUFFER_VERSION {
            return Err(ErrorCode::NotSupported);
        }
        let time_type = r.u8()?;
        let a = r.u64()?;
        let b = r.u64()?;
        let length = r.u64()?;
        let rsp_id = r.u64()?;
        let rsp_topic = r.topic_str()?;
        let time = match time_type {
            0 => TimeRange::Utc {
                start: UtcTime::from_q30(a as i64),
                end: UtcTime::from_q30(b as i64),
                length,
            },
            1 => TimeRange::Samples {
                start: a,
                end: b,
                length,
            },
            _ => return Err(ErrorCode::SyntaxError),
        };
        Ok(BufferRequest {
            version,
            time,
            rsp_topic,
            rsp_id,
        })
    }
}

/// Per-signal buffer state, retained on `m/{id}/s/{signal_id}/info` and
/// embedded in every response.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub version: u8,
    pub field_id: u8,
    pub index: u8,
    pub element_type: ElementType,
    pub element_size_bits: u8,
    /// Source topic of the signal.
    pub topic: String,
    pub size_in_samples: u64,
    /// Range currently held (or returned), `[start, end)`.
    pub sample_id_start: u64,
    pub sample_id_end: u64,
    pub utc_start: UtcTime,
    pub utc_end: UtcTime,
    pub sample_rate: u32,
    pub decimate_factor: u32,
    pub time_map: TimeMap,
}

impl BufferInfo {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(96);
        out.push(self.version);
        out.push(self.field_id);
        out.push(self.index);
        out.push(self.element_type as u8);
        out.push(self.element_size_bits);
        put_u64(&mut out, self.size_in_samples);
        put_u64(&mut out, self.sample_id_start);
        put_u64(&mut out, self.sample_id_end);
        put_u64(&mut out, self.utc_start.q30() as u64);
        put_u64(&mut out, self.utc_end.q30() as u64);
        put_u32(&mut out, self.sample_rate);
        put_u32(&mut out, self.decimate_factor);
        put_time_map(&mut out, &self.time_map);
        put_topic_str(&mut out, &self.topic)?;
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<BufferInfo> {
        Self::parse_reader(&mut Reader::new(buf))
    }

    fn parse_reader(r: &mut Reader<'_>) -> Result<BufferInfo> {
        let version = r.u8()?;
        if version != BUFFER_VERSION {
            return Err(ErrorCode::NotSupported);
        }
        let field_id = r.u8()?;
        let index = r.u8()?;
        let element_type = ElementType::from_u8(r.u8()?)?;
        let element_size_bits = r.u8()?;
        let size_in_samples = r.u64()?;
        let sample_id_start = r.u64()?;
        let sample_id_end = r.u64()?;
        let utc_start = UtcTime::from_q30(r.i64()?);
        let utc_end = UtcTime::from_q30(r.i64()?);
        let sample_rate = r.u32()?;
        let decimate_factor = r.u32()?;
        let time_map = read_time_map(r)?;
        let topic = r.topic_str()?;
        Ok(BufferInfo {
            version,
            field_id,
            index,
            element_type,
            element_size_bits,
            topic,
            size_in_samples,
            sample_id_start,
            sample_id_end,
            utc_start,
            utc_end,
            sample_rate,
            decimate_factor,
            time_map,
        })
    }
}

/// The data section of a buffer response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    /// Raw samples in the signal's element representation.
    Samples(Vec<u8>),
    Summary(Vec<SummaryEntry>),
}

/// A response published to the request's `rsp_topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferResponse {
    pub version: u8,
    pub rsp_id: u64,
    pub info: BufferInfo,
    pub data: ResponseData,
}

impl BufferResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let info = self.info.encode()?;
        let mut out = Vec::with_capacity(32 + info.len());
        out.push(self.version);
        match &self.data {
            ResponseData::Samples(_) => out.push(0),
            ResponseData::Summary(_) => out.push(1),
        }
        put_u64(&mut out, self.rsp_id);
        out.extend_from_slice(&info);
        match &self.data {
            ResponseData::Samples(data) => {
                put_u64(&mut out, data.len() as u64);
                out.extend_from_slice(data);
            }
            ResponseData::Summary(entries) => {
                put_u64(&mut out, entries.len() as u64);
                for e in entries {
                    put_f32(&mut out, e.avg);
                    put_f32(&mut out, e.std);
                    put_f32(&mut out, e.min);
                    put_f32(&mut out, e.max);
                }
            }
        }
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<BufferResponse> {
        let mut r = Reader::new(buf);
        let version = r.u8()?;
        if version != BUFFER_VERSION {
            return Err(ErrorCode::NotSupported);
        }
        let response_type = r.u8()?;
        let rsp_id = r.u64()?;
        let info = BufferInfo::parse_reader(&mut r)?;
        let n = r.u64()? as usize;
        let data = match response_type {
            0 => ResponseData::Samples(r.bytes(n)?.to_vec()),
            1 => {
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    entries.push(SummaryEntry {
                        avg: r.f32()?,
                        std: r.f32()?,
                        min: r.f32()?,
                        max: r.f32()?,
                    });
                }
                ResponseData::Summary(entries)
            }
            _ => return Err(ErrorCode::SyntaxError),
        };
        Ok(BufferResponse {
            version,
            rsp_id,
            info,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time_map() -> TimeMap {
        TimeMap::new(UtcTime::from_secs(100), 1_000_000, 1_000_000.0)
    }

    #[test]
    fn stream_header_is_48_bytes() {
        let hdr = StreamHeader {
            sample_id: 42,
            field_id: 1,
            index: 0,
            element_type: ElementType::Float,
            element_size_bits: 32,
            element_count: 2,
            sample_rate: 1_000_000,
            decimate_factor: 1,
            time_map: test_time_map(),
        };
        let buf = hdr.encode(&[0u8; 8]);
        assert_eq!(buf.len(), STREAM_HEADER_SIZE + 8);
        let (parsed, data) = StreamHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn stream_header_truncated() {
        let hdr = StreamHeader {
            sample_id: 0,
            field_id: 0,
            index: 0,
            element_type: ElementType::UInt,
            element_size_bits: 4,
            element_count: 0,
            sample_rate: 2_000_000,
            decimate_factor: 2,
            time_map: test_time_map(),
        };
        let buf = hdr.encode(&[]);
        assert_eq!(
            StreamHeader::parse(&buf[..STREAM_HEADER_SIZE - 1]),
            Err(ErrorCode::TooSmall)
        );
    }

    #[test]
    fn request_round_trip() {
        let req = BufferRequest::new(
            TimeRange::Samples {
                start: 1000,
                end: 1999,
                length: 1000,
            },
            "a/rsp",
            7,
        );
        let buf = req.encode().unwrap();
        assert_eq!(BufferRequest::parse(&buf).unwrap(), req);

        let req = BufferRequest::new(
            TimeRange::Utc {
                start: UtcTime::from_secs(1),
                end: UtcTime::from_secs(2),
                length: 100,
            },
            "a/rsp",
            8,
        );
        let buf = req.encode().unwrap();
        assert_eq!(BufferRequest::parse(&buf).unwrap(), req);
    }

    #[test]
    fn response_round_trip() {
        let info = BufferInfo {
            version: BUFFER_VERSION,
            field_id: 2,
            index: 0,
            element_type: ElementType::Float,
            element_size_bits: 32,
            topic: "u/js220/001/s/i/!data".to_string(),
            size_in_samples: 1000,
            sample_id_start: 5000,
            sample_id_end: 6000,
            utc_start: UtcTime::from_secs(10),
            utc_end: UtcTime::from_secs(11),
            sample_rate: 1000,
            decimate_factor: 1,
            time_map: test_time_map(),
        };
        let rsp = BufferResponse {
            version: BUFFER_VERSION,
            rsp_id: 12,
            info: info.clone(),
            data: ResponseData::Summary(vec![
                SummaryEntry {
                    avg: 1.0,
                    std: 0.5,
                    min: 0.0,
                    max: 2.0,
                },
                SummaryEntry::NAN,
            ]),
        };
        let buf = rsp.encode().unwrap();
        let parsed = BufferResponse::parse(&buf).unwrap();
        assert_eq!(parsed.rsp_id, 12);
        assert_eq!(parsed.info, info);
        match parsed.data {
            ResponseData::Summary(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].avg, 1.0);
                assert!(entries[1].is_nan());
            }
            _ => panic!("expected summary"),
        }
    }
}
