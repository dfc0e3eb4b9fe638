//! TCG PC-client firmware event log.
//!
//! Both the crypto-agile format (first event carries a "Spec ID Event03"
//! header) and the legacy SHA-1 only format are understood. Replaying the log
//! reconstructs the PCR values the firmware and boot chain extended.

use ring::digest::{self, Algorithm};
use std::collections::BTreeMap;
use tracing::debug;

use crate::attestation::errors::AttnError;
use crate::attestation::pcr::{HashAlg, Pcr};
use crate::attestation::util::constant_time_eq;

pub const EV_NO_ACTION: u32 = 0x0000_0003;

const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";
const SHA1_SIZE: usize = 20;
const MAX_EVENT_DATA: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub pcr_index: u32,
    pub event_type: u32,
    pub digests: Vec<(HashAlg, Vec<u8>)>,
    pub data: Vec<u8>,
}

impl Event {
    fn digest(&self, alg: HashAlg) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|(a, _)| *a == alg)
            .map(|(_, d)| d.as_slice())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    /// Banks the log carries digests for.
    pub algs: Vec<HashAlg>,
    pub events: Vec<Event>,
    startup_locality: Option<u8>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], AttnError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                AttnError::EventLogParse(format!("truncated event at offset {}", self.pos))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, AttnError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AttnError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, AttnError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn event_data(&mut self) -> Result<&'a [u8], AttnError> {
        let size = self.u32()? as usize;
        if size > MAX_EVENT_DATA {
            return Err(AttnError::EventLogParse(format!("event data too large: {size}")));
        }
        self.bytes(size)
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

impl EventLog {
    pub fn parse(raw: &[u8]) -> Result<Self, AttnError> {
        if raw.is_empty() {
            return Err(AttnError::EventLogParse("event log is empty".into()));
        }
        let mut c = Cursor { buf: raw, pos: 0 };

        let first = parse_legacy_event(&mut c)?;
        let spec_sizes = if first.event_type == EV_NO_ACTION
            && first.data.starts_with(SPEC_ID_SIGNATURE)
        {
            Some(parse_spec_id(&first.data)?)
        } else {
            None
        };

        let mut log = EventLog::default();
        match spec_sizes {
            Some(sizes) => {
                log.algs = sizes.iter().filter_map(|(alg, _, _)| *alg).collect();
                while !c.done() {
                    let ev = parse_agile_event(&mut c, &sizes)?;
                    log.note(&ev);
                    log.events.push(ev);
                }
            }
            None => {
                log.algs = vec![HashAlg::SHA1];
                log.note(&first);
                log.events.push(first);
                while !c.done() {
                    let ev = parse_legacy_event(&mut c)?;
                    log.note(&ev);
                    log.events.push(ev);
                }
            }
        }
        debug!(events = log.events.len(), banks = log.algs.len(), "parsed event log");
        Ok(log)
    }

    fn note(&mut self, ev: &Event) {
        if ev.event_type == EV_NO_ACTION
            && ev.pcr_index == 0
            && ev.data.len() > STARTUP_LOCALITY_SIGNATURE.len()
            && ev.data.starts_with(STARTUP_LOCALITY_SIGNATURE)
        {
            self.startup_locality = Some(ev.data[STARTUP_LOCALITY_SIGNATURE.len()]);
        }
    }

    /// PCR values of bank `alg` after replaying every measured event.
    ///
    /// Only PCRs the log touches are returned.
    pub fn replay(&self, alg: HashAlg) -> Result<BTreeMap<u32, Vec<u8>>, AttnError> {
        let algorithm = ring_alg(alg)?;
        let size = algorithm.output_len();
        let mut pcrs: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        for ev in self.events.iter().filter(|e| e.event_type != EV_NO_ACTION) {
            let measured = ev.digest(alg).ok_or_else(|| {
                AttnError::EventLogReplay(format!(
                    "event for pcr {} has no digest in bank {}",
                    ev.pcr_index, alg.0
                ))
            })?;
            let value = pcrs.entry(ev.pcr_index).or_insert_with(|| {
                let mut init = vec![0u8; size];
                if ev.pcr_index == 0 {
                    if let Some(locality) = self.startup_locality {
                        init[size - 1] = locality;
                    }
                }
                init
            });
            let mut ctx = digest::Context::new(algorithm);
            ctx.update(value.as_slice());
            ctx.update(measured);
            *value = ctx.finish().as_ref().to_vec();
        }
        Ok(pcrs)
    }

    /// Replays every bank the log carries and checks the submitted PCRs of
    /// that bank against it.
    pub fn verify(&self, pcrs: &[Pcr]) -> Result<(), AttnError> {
        let mut checked = 0usize;
        for alg in &self.algs {
            if ring_alg(*alg).is_err() {
                continue;
            }
            let replayed = self.replay(*alg)?;
            for pcr in pcrs.iter().filter(|p| p.digest_alg == *alg) {
                let Ok(index) = u32::try_from(pcr.index) else {
                    continue;
                };
                let Some(want) = replayed.get(&index) else {
                    continue;
                };
                if !constant_time_eq(want, pcr.digest.as_slice()) {
                    return Err(AttnError::EventLogReplay(format!(
                        "pcr {index} in bank {} does not match replayed event log",
                        alg.0
                    )));
                }
                checked += 1;
            }
        }
        if checked == 0 {
            return Err(AttnError::EventLogReplay(
                "no submitted pcr is covered by the event log".into(),
            ));
        }
        Ok(())
    }
}

fn ring_alg(alg: HashAlg) -> Result<&'static Algorithm, AttnError> {
    match alg {
        HashAlg::SHA1 => Ok(&digest::SHA1_FOR_LEGACY_USE_ONLY),
        HashAlg::SHA256 => Ok(&digest::SHA256),
        other => Err(AttnError::EventLogReplay(format!("unsupported bank {}", other.0))),
    }
}

fn parse_legacy_event(c: &mut Cursor<'_>) -> Result<Event, AttnError> {
    let pcr_index = c.u32()?;
    let event_type = c.u32()?;
    let digest = c.bytes(SHA1_SIZE)?.to_vec();
    let data = c.event_data()?.to_vec();
    Ok(Event {
        pcr_index,
        event_type,
        digests: vec![(HashAlg::SHA1, digest)],
        data,
    })
}

/// TPM_ALG_ID to digest size table from the Spec ID event. Algorithms we
/// cannot replay are kept as `None` so their digests can be skipped.
type DigestSizes = Vec<(Option<HashAlg>, u16, usize)>;

fn parse_spec_id(data: &[u8]) -> Result<DigestSizes, AttnError> {
    let mut c = Cursor { buf: data, pos: 0 };
    c.bytes(SPEC_ID_SIGNATURE.len())?;
    let _platform_class = c.u32()?;
    let _minor = c.u8()?;
    let _major = c.u8()?;
    let _errata = c.u8()?;
    let _uintn_size = c.u8()?;
    let count = c.u32()?;
    let mut sizes = Vec::new();
    for _ in 0..count {
        let id = c.u16()?;
        let size = c.u16()? as usize;
        sizes.push((HashAlg::from_tpm_alg_id(id), id, size));
    }
    Ok(sizes)
}

fn parse_agile_event(c: &mut Cursor<'_>, sizes: &DigestSizes) -> Result<Event, AttnError> {
    let pcr_index = c.u32()?;
    let event_type = c.u32()?;
    let count = c.u32()?;
    let mut digests = Vec::new();
    for _ in 0..count {
        let id = c.u16()?;
        let (alg, _, size) = sizes
            .iter()
            .find(|(_, known, _)| *known == id)
            .ok_or_else(|| AttnError::EventLogParse(format!("unknown digest algorithm {id:#06x}")))?;
        let digest = c.bytes(*size)?.to_vec();
        if let Some(alg) = alg {
            digests.push((*alg, digest));
        }
    }
    let data = c.event_data()?.to_vec();
    Ok(Event {
        pcr_index,
        event_type,
        digests,
        data,
    })
}
