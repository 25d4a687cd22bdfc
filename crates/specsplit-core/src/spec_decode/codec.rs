//! Versioned binary encoding of the frames' payloads.
//!
//! Every payload starts with an 8-byte envelope:
//!
//! ```text
//! magic "SPSD" (4) | version u16 | kind u8 | flags u8 | body
//! ```
//!
//! All integers are big-endian. A tensor is written as
//! `dtype u8 | ndim u8 | dims u64 * ndim | byte_len u64 | bytes`, with the
//! element bytes in little-endian order. Tensors carry no device field: only
//! [`Staged`] records are encoded, so everything on the wire is host data.

use super::interfaces::{Logprob, PromptLogprobs, SpeculativeProposals, SpeculativeScores, Staged};
use super::tensor::{DType, Tensor};
use crate::error::{Result, SplitError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

pub const MAGIC: [u8; 4] = *b"SPSD";
pub const WIRE_VERSION: u16 = 1;
pub const ENVELOPE_LEN: usize = 8;

const FLAG_NO_PROPOSALS: u8 = 0b01;
const FLAG_HIDDEN_STATES: u8 = 0b01;
const FLAG_PROMPT_LOGPROBS: u8 = 0b10;

/// Discriminant of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Proposals = 1,
    Scores = 2,
    Heartbeat = 3,
    HeartbeatAck = 4,
}

impl MessageKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageKind::Proposals),
            2 => Some(MessageKind::Scores),
            3 => Some(MessageKind::Heartbeat),
            4 => Some(MessageKind::HeartbeatAck),
            _ => None,
        }
    }
}

/// One decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Proposals(Staged<SpeculativeProposals>),
    Scores(Staged<SpeculativeScores>),
    Heartbeat { nonce: u64 },
    HeartbeatAck { nonce: u64 },
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Proposals(_) => MessageKind::Proposals,
            WireMessage::Scores(_) => MessageKind::Scores,
            WireMessage::Heartbeat { .. } => MessageKind::Heartbeat,
            WireMessage::HeartbeatAck { .. } => MessageKind::HeartbeatAck,
        }
    }

    /// Serialize into a frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u16(WIRE_VERSION);
        buf.put_u8(self.kind() as u8);

        match self {
            WireMessage::Proposals(staged) => {
                let p = staged.get();
                buf.put_u8(if p.has_no_proposals() { FLAG_NO_PROPOSALS } else { 0 });
                put_tensor(&mut buf, p.proposal_token_ids())?;
                put_tensor(&mut buf, p.proposal_probs())?;
                put_tensor(&mut buf, p.proposal_lens())?;
            }
            WireMessage::Scores(staged) => {
                let s = staged.get();
                let mut flags = 0;
                if s.hidden_states().is_some() {
                    flags |= FLAG_HIDDEN_STATES;
                }
                if s.prompt_logprobs().is_some() {
                    flags |= FLAG_PROMPT_LOGPROBS;
                }
                buf.put_u8(flags);
                put_tensor(&mut buf, s.probs())?;
                put_tensor(&mut buf, s.logprobs())?;
                put_tensor(&mut buf, s.token_ids())?;
                if let Some(hidden) = s.hidden_states() {
                    put_tensor(&mut buf, hidden)?;
                }
                if let Some(prompt) = s.prompt_logprobs() {
                    put_prompt_logprobs(&mut buf, prompt)?;
                }
            }
            WireMessage::Heartbeat { nonce } | WireMessage::HeartbeatAck { nonce } => {
                buf.put_u8(0);
                buf.put_u64(*nonce);
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a frame payload, validating the envelope and record invariants.
    pub fn decode(payload: impl Into<Bytes>) -> Result<Self> {
        let mut r = Reader::new(payload.into());

        let magic = r.take(MAGIC.len())?;
        if magic[..] != MAGIC {
            return Err(SplitError::codec(format!("bad magic {:02x?}", &magic[..])));
        }
        let version = r.u16()?;
        if version != WIRE_VERSION {
            return Err(SplitError::codec(format!(
                "unsupported wire version {} (expected {})",
                version, WIRE_VERSION
            )));
        }
        let code = r.u8()?;
        let kind = MessageKind::from_code(code)
            .ok_or_else(|| SplitError::codec(format!("unknown message kind {}", code)))?;
        let flags = r.u8()?;

        let message = match kind {
            MessageKind::Proposals => {
                check_flags(flags, FLAG_NO_PROPOSALS)?;
                let token_ids = r.tensor()?;
                let probs = r.tensor()?;
                let lens = r.tensor()?;
                let proposals = SpeculativeProposals::from_parts(
                    token_ids,
                    probs,
                    lens,
                    flags & FLAG_NO_PROPOSALS != 0,
                )?;
                WireMessage::Proposals(Staged::from_wire(proposals))
            }
            MessageKind::Scores => {
                check_flags(flags, FLAG_HIDDEN_STATES | FLAG_PROMPT_LOGPROBS)?;
                let probs = r.tensor()?;
                let logprobs = r.tensor()?;
                let token_ids = r.tensor()?;
                let mut scores = SpeculativeScores::new(probs, logprobs, token_ids)?;
                if flags & FLAG_HIDDEN_STATES != 0 {
                    scores = scores.with_hidden_states(r.tensor()?)?;
                }
                if flags & FLAG_PROMPT_LOGPROBS != 0 {
                    scores = scores.with_prompt_logprobs(r.prompt_logprobs()?);
                }
                WireMessage::Scores(Staged::from_wire(scores))
            }
            MessageKind::Heartbeat => {
                check_flags(flags, 0)?;
                WireMessage::Heartbeat { nonce: r.u64()? }
            }
            MessageKind::HeartbeatAck => {
                check_flags(flags, 0)?;
                WireMessage::HeartbeatAck { nonce: r.u64()? }
            }
        };

        if r.remaining() != 0 {
            return Err(SplitError::codec(format!(
                "{} trailing bytes after {:?} message",
                r.remaining(),
                kind
            )));
        }
        Ok(message)
    }
}

fn check_flags(flags: u8, allowed: u8) -> Result<()> {
    if flags & !allowed != 0 {
        return Err(SplitError::codec(format!("unknown flag bits {:#04x}", flags)));
    }
    Ok(())
}

fn put_tensor(buf: &mut BytesMut, tensor: &Tensor) -> Result<()> {
    if !tensor.device().is_host() {
        return Err(SplitError::codec(format!(
            "refusing to encode tensor resident on {}",
            tensor.device()
        )));
    }
    let ndim = u8::try_from(tensor.ndim()).map_err(|_| {
        SplitError::codec(format!("tensor has too many dimensions ({})", tensor.ndim()))
    })?;
    buf.put_u8(tensor.dtype().code());
    buf.put_u8(ndim);
    for &d in tensor.shape() {
        buf.put_u64(d as u64);
    }
    buf.put_u64(tensor.as_bytes().len() as u64);
    buf.put_slice(tensor.as_bytes());
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize, what: &str) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| SplitError::codec(format!("too many {}", what)))?;
    buf.put_u32(len);
    Ok(())
}

fn put_prompt_logprobs(buf: &mut BytesMut, prompt: &[PromptLogprobs]) -> Result<()> {
    put_len(buf, prompt.len(), "prompt logprob requests")?;
    for request in prompt {
        put_len(buf, request.len(), "prompt positions")?;
        for position in request {
            let Some(entries) = position else {
                buf.put_u8(0);
                continue;
            };
            buf.put_u8(1);
            put_len(buf, entries.len(), "logprob entries")?;
            for (&token_id, lp) in entries {
                buf.put_u32(token_id);
                buf.put_f32(lp.logprob);
                match lp.rank {
                    Some(rank) => {
                        buf.put_u8(1);
                        buf.put_u32(rank);
                    }
                    None => buf.put_u8(0),
                }
                match &lp.decoded_token {
                    Some(text) => {
                        buf.put_u8(1);
                        put_len(buf, text.len(), "decoded token bytes")?;
                        buf.put_slice(text.as_bytes());
                    }
                    None => buf.put_u8(0),
                }
            }
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SplitError::codec(format!(
                "truncated payload: need {} more bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.copy_to_bytes(n))
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SplitError::codec(format!("invalid presence byte {}", other))),
        }
    }

    fn tensor(&mut self) -> Result<Tensor> {
        let code = self.u8()?;
        let dtype = DType::from_code(code)
            .ok_or_else(|| SplitError::codec(format!("unknown dtype code {}", code)))?;
        let ndim = self.u8()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let d = self.u64()?;
            let d = usize::try_from(d)
                .map_err(|_| SplitError::codec(format!("dimension {} does not fit in memory", d)))?;
            shape.push(d);
        }

        let byte_len = self.u64()?;
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| SplitError::codec(format!("tensor shape {:?} overflows", shape)))?;
        if byte_len != expected as u64 {
            return Err(SplitError::codec(format!(
                "{} tensor of shape {:?} declares {} bytes, expected {}",
                dtype, shape, byte_len, expected
            )));
        }
        let data = self.take(expected)?;
        Tensor::from_raw(dtype, shape, data)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| SplitError::codec(format!("decoded token is not UTF-8: {}", e)))
    }

    fn prompt_logprobs(&mut self) -> Result<Vec<PromptLogprobs>> {
        let requests = self.u32()? as usize;
        let mut out = Vec::new();
        for _ in 0..requests {
            let positions = self.u32()? as usize;
            let mut request = Vec::new();
            for _ in 0..positions {
                if !self.flag()? {
                    request.push(None);
                    continue;
                }
                let entries = self.u32()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..entries {
                    let token_id = self.u32()?;
                    let logprob = self.f32()?;
                    let rank = if self.flag()? { Some(self.u32()?) } else { None };
                    let decoded_token = if self.flag()? { Some(self.string()?) } else { None };
                    map.insert(
                        token_id,
                        Logprob {
                            logprob,
                            rank,
                            decoded_token,
                        },
                    );
                }
                request.push(Some(map));
            }
            out.push(request);
        }
        Ok(out)
    }
}
