//! Per-signal sample storage: a level-0 ring plus a pyramid of
//! `{avg, std, min, max}` summary levels.
//!
//! Level 0 holds the raw samples (plain float32, or bit-packed 1-/4-bit
//! unsigned). Level 1 reduces `r0` consecutive samples per entry; every
//! higher level reduces `rN` entries of the level below. Entry slots are
//! addressed modulo each level's capacity, so a slot is recomputed exactly
//! when the window it covers completes.
//!
//! Sample ids are post-decimation throughout this module; the ingest path
//! rescales the incoming block's time map into the same domain.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{ErrorCode, Result};
use crate::statistics::{StatisticsAccum, SummaryEntry};
use crate::time::{TimeMap, UtcTime};
use crate::tmap::Tmap;
use crate::wire::{BufferInfo, ElementType, StreamHeader, BUFFER_VERSION, SUMMARY_LENGTH_MAX};

/// Level-1 reduction factor by element representation.
pub fn r0_for(element_type: ElementType) -> u64 {
    match element_type {
        ElementType::Float => 128,
        ElementType::UInt => 1024,
    }
}

/// Reduction factor between consecutive summary levels.
pub const RN: u64 = 32;

/// Bytes per summary pyramid entry.
pub const SUMMARY_ENTRY_SIZE: u64 = 16;

/// Stream configuration, fixed at the first observed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigMeta {
    pub field_id: u8,
    pub index: u8,
    pub element_type: ElementType,
    pub element_size_bits: u8,
    pub sample_rate: u32,
    pub decimate_factor: u32,
}

impl SigMeta {
    fn from_header(header: &StreamHeader) -> Result<SigMeta> {
        match (header.element_type, header.element_size_bits) {
            (ElementType::Float, 32) => {}
            (ElementType::UInt, 1) | (ElementType::UInt, 4) => {}
            _ => {
                warn!(
                    "unsupported stream element: type {:?}, {} bits",
                    header.element_type, header.element_size_bits
                );
                return Err(ErrorCode::NotSupported);
            }
        }
        if header.sample_rate == 0 {
            return Err(ErrorCode::ParameterInvalid);
        }
        Ok(SigMeta {
            field_id: header.field_id,
            index: header.index,
            element_type: header.element_type,
            element_size_bits: header.element_size_bits,
            sample_rate: header.sample_rate,
            decimate_factor: header.decimate_factor.max(1),
        })
    }

    /// Post-decimation sample rate.
    pub fn effective_rate(&self) -> f64 {
        self.sample_rate as f64 / self.decimate_factor as f64
    }
}

enum RingStore {
    F32(Vec<f32>),
    Packed { bits: u64, data: Vec<u8> },
}

struct Level {
    /// Level-0 samples per entry.
    spe: u64,
    entries: Vec<SummaryEntry>,
}

struct SigStore {
    n: u64,
    ring: RingStore,
    levels: Vec<Level>,
    /// Sample id one past the newest stored sample.
    sample_id_head: u64,
    /// Current fill, `<= n`.
    size: u64,
    anchored: bool,
}

impl SigStore {
    fn reset(&mut self) {
        self.size = 0;
        self.anchored = false;
    }

    fn reset_to(&mut self, sample_id: u64) {
        self.size = 0;
        self.sample_id_head = sample_id;
        self.anchored = true;
    }

    fn sample(&self, sid: u64) -> f64 {
        let idx = sid % self.n;
        match &self.ring {
            RingStore::F32(ring) => ring[idx as usize] as f64,
            RingStore::Packed { bits, data } => {
                let mask = (1u16 << bits) as u8 - 1;
                let bit = idx * bits;
                ((data[(bit / 8) as usize] >> (bit % 8)) & mask) as f64
            }
        }
    }

    /// Gap fill: NaN for floats, zero for packed integers.
    fn fill(&mut self, start_sid: u64, end_sid: u64) {
        let n = self.n;
        match &mut self.ring {
            RingStore::F32(ring) => {
                for sid in start_sid..end_sid {
                    ring[(sid % n) as usize] = f32::NAN;
                }
            }
            RingStore::Packed { bits, data } => {
                let bits = *bits;
                let mask = (1u16 << bits) as u8 - 1;
                for sid in start_sid..end_sid {
                    let bit = (sid % n) * bits;
                    data[(bit / 8) as usize] &= !(mask << (bit % 8));
                }
            }
        }
    }

    fn write_samples(&mut self, start_sid: u64, src: &[u8], count: u64) -> Result<()> {
        let n = self.n;
        match &mut self.ring {
            RingStore::F32(ring) => {
                if (src.len() as u64) < count * 4 {
                    return Err(ErrorCode::ParameterInvalid);
                }
                for (i, chunk) in src.chunks_exact(4).take(count as usize).enumerate() {
                    let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    ring[((start_sid + i as u64) % n) as usize] = v;
                }
            }
            RingStore::Packed { bits, data } => {
                let bits = *bits;
                if (src.len() as u64) < (count * bits).div_ceil(8) {
                    return Err(ErrorCode::ParameterInvalid);
                }
                let mask = (1u16 << bits) as u8 - 1;
                for i in 0..count {
                    let src_bit = i * bits;
                    let v = (src[(src_bit / 8) as usize] >> (src_bit % 8)) & mask;
                    let dst_bit = ((start_sid + i) % n) * bits;
                    let byte = &mut data[(dst_bit / 8) as usize];
                    let sh = dst_bit % 8;
                    *byte = (*byte & !(mask << sh)) | (v << sh);
                }
            }
        }
        Ok(())
    }

    /// Encodes the sample range `[lo, hi)` in the element representation,
    /// packed from bit 0.
    fn encode_samples(&self, lo: u64, hi: u64) -> Vec<u8> {
        let n = self.n;
        match &self.ring {
            RingStore::F32(ring) => {
                let mut out = Vec::with_capacity(((hi - lo) * 4) as usize);
                for sid in lo..hi {
                    out.extend_from_slice(&ring[(sid % n) as usize].to_le_bytes());
                }
                out
            }
            RingStore::Packed { bits, data } => {
                let bits = *bits;
                let mask = (1u16 << bits) as u8 - 1;
                let mut out = vec![0u8; (((hi - lo) * bits).div_ceil(8)) as usize];
                for (i, sid) in (lo..hi).enumerate() {
                    let src_bit = (sid % n) * bits;
                    let v = (data[(src_bit / 8) as usize] >> (src_bit % 8)) & mask;
                    let dst_bit = i as u64 * bits;
                    out[(dst_bit / 8) as usize] |= v << (dst_bit % 8);
                }
                out
            }
        }
    }

    /// Direct level-0 accumulation over `[lo, hi)`, skipping NaN.
    fn stats_over(&self, lo: u64, hi: u64) -> StatisticsAccum {
        let mut acc = StatisticsAccum::new();
        for sid in lo..hi {
            let v = self.sample(sid);
            if !v.is_nan() {
                acc.add(v);
            }
        }
        acc
    }

    /// Recomputes every summary entry completed by the write `[ws, we)`.
    ///
    /// Level 1 entries come straight from the ring; level k entries fold
    /// the `RN` covered entries of level k-1 with the statistics merge.
    fn summarize(&mut self, ws: u64, we: u64) {
        let n = self.n;
        for li in 0..self.levels.len() {
            let spe = self.levels[li].spe;
            let count = n / spe;
            let e0 = ws / spe;
            let e1 = we / spe;
            if e0 >= e1 {
                // Nothing completed here, so nothing above either.
                break;
            }
            for e in e0..e1 {
                let entry = if li == 0 {
                    self.stats_over(e * spe, (e + 1) * spe).to_entry()
                } else {
                    let child_spe = self.levels[li - 1].spe;
                    let child_count = n / child_spe;
                    let step = spe / child_spe;
                    let mut acc = StatisticsAccum::new();
                    for c in (e * step)..((e + 1) * step) {
                        let child = self.levels[li - 1].entries[(c % child_count) as usize];
                        if !child.is_nan() {
                            acc.combine_with(&StatisticsAccum::from_entry(&child, child_spe));
                        }
                    }
                    acc.to_entry()
                };
                self.levels[li].entries[(e % count) as usize] = entry;
            }
        }
    }
}

/// Per-signal buffer state.
pub struct BufSig {
    pub signal_id: u8,
    pub source_topic: String,
    pub active: bool,
    meta: Option<SigMeta>,
    store: Option<SigStore>,
    pub tmap: Arc<Tmap>,
}

impl BufSig {
    pub fn new(signal_id: u8) -> BufSig {
        BufSig {
            signal_id,
            source_topic: String::new(),
            active: false,
            meta: None,
            store: None,
            tmap: Tmap::new(),
        }
    }

    pub fn meta(&self) -> Option<&SigMeta> {
        self.meta.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.store.is_some()
    }

    /// Records (or checks) the stream configuration from a block header.
    /// A changed configuration is refused; the caller decides whether to
    /// tear the signal down.
    pub fn observe_header(&mut self, header: &StreamHeader) -> Result<()> {
        let meta = SigMeta::from_header(header)?;
        match self.meta {
            None => {
                self.meta = Some(meta);
                Ok(())
            }
            Some(existing) if existing == meta => Ok(()),
            Some(existing) => {
                warn!(
                    "stream configuration changed on {}: {:?} -> {:?}",
                    self.source_topic, existing, meta
                );
                Err(ErrorCode::NotSupported)
            }
        }
    }

    /// Frees sample storage and stream configuration, keeping the source
    /// topic binding.
    pub fn dealloc(&mut self) {
        self.store = None;
        self.meta = None;
        self.tmap.clear();
    }

    /// Drops buffered samples but keeps allocation and configuration.
    pub fn clear(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.reset();
        }
        self.tmap.clear();
    }

    /// Allocates the ring and pyramid for roughly `duration_samples` of
    /// storage, rounded to the nearest whole top-level summary window.
    pub fn alloc(&mut self, duration_samples: u64) -> Result<()> {
        let meta = self.meta.ok_or(ErrorCode::Unavailable)?;
        let r0 = r0_for(meta.element_type);
        let mut spe_top = r0;
        while duration_samples >= spe_top * RN {
            spe_top *= RN;
        }
        let n = (((duration_samples + spe_top / 2) / spe_top) * spe_top).max(spe_top);
        let ring = match meta.element_type {
            ElementType::Float => RingStore::F32(vec![f32::NAN; n as usize]),
            ElementType::UInt => RingStore::Packed {
                bits: meta.element_size_bits as u64,
                data: vec![0u8; (n * meta.element_size_bits as u64).div_ceil(8) as usize],
            },
        };
        let mut levels = Vec::new();
        let mut spe = r0;
        loop {
            levels.push(Level {
                spe,
                entries: vec![SummaryEntry::NAN; (n / spe) as usize],
            });
            if spe == spe_top {
                break;
            }
            spe *= RN;
        }
        self.store = Some(SigStore {
            n,
            ring,
            levels,
            sample_id_head: 0,
            size: 0,
            anchored: false,
        });
        Ok(())
    }

    /// Capacity in samples.
    pub fn capacity(&self) -> u64 {
        self.store.as_ref().map_or(0, |s| s.n)
    }

    /// The retained sample range `[start, end)`.
    pub fn range(&self) -> (u64, u64) {
        match &self.store {
            Some(s) if s.anchored => (s.sample_id_head - s.size, s.sample_id_head),
            _ => (0, 0),
        }
    }

    /// Ingests one stream block.
    pub fn recv_data(&mut self, header: &StreamHeader, data: &[u8]) -> Result<()> {
        self.observe_header(header)?;
        let meta = self.meta.expect("meta recorded by observe_header");
        let decimate = meta.decimate_factor as u64;
        if header.time_map.is_valid() {
            // Rescale the block's time map into post-decimation ids.
            self.tmap.add(TimeMap {
                offset_time: header.time_map.offset_time,
                offset_counter: header.time_map.offset_counter / decimate,
                counter_rate: header.time_map.counter_rate / decimate as f64,
            });
        }
        let Some(store) = self.store.as_mut() else {
            // Configuration observed but storage not allocated yet; the
            // buffer worker allocates once every active signal has a header.
            return Ok(());
        };
        let count = header.element_count as u64;
        if count == 0 {
            return Ok(());
        }
        let sid = header.sample_id / decimate;
        let end = sid + count;
        if !store.anchored {
            store.reset_to(sid);
        }
        let head = store.sample_id_head;
        if end <= head {
            let gap = head - end;
            if gap < store.n {
                warn!(
                    "stream rewind on {}: block ends at {} behind head {}, reset",
                    self.source_topic, end, head
                );
            } else {
                debug!("stream restart on {} at {}", self.source_topic, sid);
            }
            store.reset();
            return Ok(());
        }
        if sid < head {
            // Partial overlap: never rewrite already-stored samples.
            warn!(
                "stream overlap on {}: [{}, {}) vs head {}, block dropped",
                self.source_topic, sid, end, head
            );
            return Ok(());
        }
        if sid > head {
            let gap = sid - head;
            if gap >= store.n {
                debug!(
                    "stream gap of {} on {} exceeds buffer, restart at {}",
                    gap, self.source_topic, sid
                );
                store.reset_to(sid);
            } else {
                store.fill(head, sid);
                store.size = (store.size + gap).min(store.n);
                store.sample_id_head = sid;
                store.summarize(head, sid);
            }
        }
        store.write_samples(sid, data, count)?;
        store.size = (store.size + count).min(store.n);
        store.sample_id_head = end;
        store.summarize(sid, end);
        Ok(())
    }

    fn make_info(&self, lo: u64, hi: u64) -> Result<BufferInfo> {
        let meta = self.meta.ok_or(ErrorCode::Unavailable)?;
        self.tmap.reader_enter();
        let utc_start = self.tmap.sample_id_to_timestamp(lo).unwrap_or(UtcTime::EPOCH);
        let utc_end = self.tmap.sample_id_to_timestamp(hi).unwrap_or(UtcTime::EPOCH);
        let time_map = self
            .tmap
            .get(self.tmap.len().wrapping_sub(1))
            .unwrap_or_default();
        self.tmap.reader_exit();
        Ok(BufferInfo {
            version: BUFFER_VERSION,
            field_id: meta.field_id,
            index: meta.index,
            element_type: meta.element_type,
            element_size_bits: meta.element_size_bits,
            topic: self.source_topic.clone(),
            size_in_samples: self.capacity(),
            sample_id_start: lo,
            sample_id_end: hi,
            utc_start,
            utc_end,
            sample_rate: meta.sample_rate,
            decimate_factor: meta.decimate_factor,
            time_map,
        })
    }

    /// Current holdings, for the retained `info` topic.
    pub fn info(&self) -> Result<BufferInfo> {
        let (lo, hi) = self.range();
        self.make_info(lo, hi)
    }

    /// Raw samples over the inclusive sample range `[start, end]`, clipped
    /// to the retained window.
    pub fn query_samples(&self, start: u64, end: u64) -> Result<(BufferInfo, Vec<u8>)> {
        if end < start {
            return Err(ErrorCode::ParameterInvalid);
        }
        let store = self.store.as_ref().ok_or(ErrorCode::Unavailable)?;
        let (tail, head) = self.range();
        let lo = start.max(tail);
        let hi = (end + 1).min(head);
        if lo >= hi {
            let info = self.make_info(tail, tail)?;
            return Ok((info, Vec::new()));
        }
        let data = store.encode_samples(lo, hi);
        Ok((self.make_info(lo, hi)?, data))
    }

    /// Multi-resolution summary over the inclusive sample range
    /// `[start, end]`, reduced to `length` entries.
    ///
    /// Each output entry covers `incr = ceil((end + 1 - start) / length)`
    /// samples. The deepest summary level whose window fits inside `incr`
    /// supplies whole windows; ragged edges accumulate level-0 samples.
    /// Entries wholly outside the retained window are NaN.
    pub fn query_summary(
        &self,
        start: u64,
        end: u64,
        length: u64,
    ) -> Result<(BufferInfo, Vec<SummaryEntry>)> {
        if end < start || length == 0 {
            return Err(ErrorCode::ParameterInvalid);
        }
        if length > SUMMARY_LENGTH_MAX {
            return Err(ErrorCode::ParameterInvalid);
        }
        let store = self.store.as_ref().ok_or(ErrorCode::Unavailable)?;
        let (tail, head) = self.range();
        let incr = (end + 1 - start).div_ceil(length);
        let mut spe_tgt = 0;
        for level in &store.levels {
            if level.spe <= incr {
                spe_tgt = level.spe;
            } else {
                break;
            }
        }
        let mut out = Vec::with_capacity(length as usize);
        for i in 0..length {
            let w0 = start + i * incr;
            let w1 = w0 + incr;
            let c0 = w0.max(tail);
            let c1 = w1.min(head);
            if c0 >= c1 {
                out.push(SummaryEntry::NAN);
                continue;
            }
            let acc = if spe_tgt == 0 {
                store.stats_over(c0, c1)
            } else {
                let a = c0.div_ceil(spe_tgt) * spe_tgt;
                let b = (c1 / spe_tgt) * spe_tgt;
                if a >= b {
                    store.stats_over(c0, c1)
                } else {
                    let level = store
                        .levels
                        .iter()
                        .find(|l| l.spe == spe_tgt)
                        .expect("target level exists");
                    let count = store.n / spe_tgt;
                    let mut acc = store.stats_over(c0, a);
                    for e in (a / spe_tgt)..(b / spe_tgt) {
                        let entry = level.entries[(e % count) as usize];
                        if !entry.is_nan() {
                            acc.combine_with(&StatisticsAccum::from_entry(&entry, spe_tgt));
                        }
                    }
                    acc.combine_with(&store.stats_over(b, c1));
                    acc
                }
            };
            out.push(acc.to_entry());
        }
        let lo = start.max(tail);
        let hi = (start + incr * length).min(head);
        let info = self.make_info(lo.min(hi), hi)?;
        Ok((info, out))
    }
}
