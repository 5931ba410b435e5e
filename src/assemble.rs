//! Whole-message view over the streaming demultiplexer.
//!
//! The live capture path and replay both stream binary payloads without
//! buffering them. Callers that want complete [`Message`] values instead, and
//! can afford to hold each payload in memory, use [`MessageAssembler`]. It
//! gathers payload slices and numbers each finalized message with its own
//! [`Sequencer`], exactly as the live session does.
use std::convert::Infallible;

use crate::demux::{DemuxConfig, DemuxStats, Demultiplexer, FrameEvent};
use crate::message::{BinaryMessage, Message, Resync, TextMessage};
use crate::sequencer::Sequencer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(Message),
    Resync(Resync),
}

impl Decoded {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Decoded::Message(m) => Some(m),
            Decoded::Resync(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct MessageAssembler {
    demux: Demultiplexer,
    sequencer: Sequencer,
    payload: Vec<u8>,
}

impl MessageAssembler {
    pub fn new(config: DemuxConfig) -> Self {
        Self::with_sequencer(config, Sequencer::new())
    }

    pub fn with_sequencer(config: DemuxConfig, sequencer: Sequencer) -> Self {
        Self {
            demux: Demultiplexer::new(config),
            sequencer,
            payload: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        let Self {
            demux,
            sequencer,
            payload,
        } = self;
        let Ok(()) = demux.feed(bytes, |ev| {
            out.extend(absorb(sequencer, payload, ev));
            Ok::<(), Infallible>(())
        });
        out
    }

    pub fn finish(&mut self) -> Option<Decoded> {
        let ev = self.demux.finalize_at_eof()?;
        absorb(&self.sequencer, &mut self.payload, ev)
    }

    pub fn stats(&self) -> DemuxStats {
        self.demux.stats()
    }
}

/// Decode a complete stream held in memory.
pub fn decode_all(config: DemuxConfig, bytes: &[u8]) -> Vec<Decoded> {
    let mut asm = MessageAssembler::new(config);
    let mut out = asm.feed(bytes);
    out.extend(asm.finish());
    out
}

fn absorb(sequencer: &Sequencer, payload: &mut Vec<u8>, ev: FrameEvent<'_>) -> Option<Decoded> {
    match ev {
        FrameEvent::Text(text) => Some(Decoded::Message(Message::Text(TextMessage {
            arrival_seq: sequencer.next(),
            payload: text,
        }))),
        FrameEvent::BinaryPayload(chunk) => {
            payload.extend_from_slice(chunk);
            None
        }
        FrameEvent::Binary(h) => Some(Decoded::Message(Message::Binary(BinaryMessage {
            arrival_seq: sequencer.next(),
            marker: h.marker,
            declared_length: h.declared_length,
            received_length: h.received_length,
            payload: std::mem::take(payload),
            truncated: h.truncated,
        }))),
        FrameEvent::Resync(r) => Some(Decoded::Resync(r)),
    }
}
