//! Protocol codec layer: turns raw [`IoBuffer`]s into application messages
//! and back, as a filter in the session pipeline.

pub mod statemachine;

use std::any::Any;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::buffer::IoBuffer;
use crate::error::Result;
use crate::filter::{IoFilter, NextFilter};
use crate::session::write_queue::WriteRequest;
use crate::session::{AttributeKey, IoSession};
use crate::Message;

/// Sink for decoded application messages.
pub trait DecoderOutput {
    fn write(&mut self, message: Message);
}

impl DecoderOutput for Vec<Message> {
    fn write(&mut self, message: Message) {
        self.push(message);
    }
}

/// Sink for encoded wire buffers.
pub trait EncoderOutput {
    fn write(&mut self, buffer: IoBuffer);
}

impl EncoderOutput for Vec<IoBuffer> {
    fn write(&mut self, buffer: IoBuffer) {
        self.push(buffer);
    }
}

/// Incremental byte-stream decoder. One instance exists per session; it must
/// tolerate arbitrary fragmentation, retaining partial state between calls.
pub trait ProtocolDecoder: Send {
    /// Consumes as much of `input` as possible, writing any completed
    /// messages to `out`. Unconsumed bytes are re-presented on the next call
    /// (the codec filter accumulates them).
    fn decode(
        &mut self,
        session: &Arc<IoSession>,
        input: &mut IoBuffer,
        out: &mut dyn DecoderOutput,
    ) -> Result<()>;

    /// Called when the input ends (session closing). Default: nothing left
    /// to deliver.
    fn finish_decode(&mut self, _session: &Arc<IoSession>, _out: &mut dyn DecoderOutput) -> Result<()> {
        Ok(())
    }

    /// Releases per-session resources.
    fn dispose(&mut self, _session: &Arc<IoSession>) {}
}

/// Turns an application message into wire buffers.
pub trait ProtocolEncoder: Send {
    fn encode(
        &mut self,
        session: &Arc<IoSession>,
        message: &(dyn Any + Send + Sync),
        out: &mut dyn EncoderOutput,
    ) -> Result<()>;

    fn dispose(&mut self, _session: &Arc<IoSession>) {}
}

type CodecFactory =
    dyn Fn() -> (Box<dyn ProtocolEncoder>, Box<dyn ProtocolDecoder>) + Send + Sync;

struct DecoderState {
    decoder: Box<dyn ProtocolDecoder>,
    /// Bytes the decoder declined to consume, re-presented with the next
    /// chunk.
    leftover: Vec<u8>,
}

static ENCODER_ATTR: AttributeKey<Mutex<Box<dyn ProtocolEncoder>>> =
    AttributeKey::new("sluice.codec.encoder");
static DECODER_ATTR: AttributeKey<Mutex<DecoderState>> = AttributeKey::new("sluice.codec.decoder");

/// Filter that applies a per-session encoder/decoder pair.
///
/// Inbound `IoBuffer` messages are decoded and each resulting message is
/// forwarded up the chain; other message types pass through untouched.
/// Outbound messages are encoded into the request's wire buffer while the
/// original message is retained for `message_sent`. On session close, any
/// decoder leftovers are finished and delivered before the closed event
/// continues up the chain.
pub struct ProtocolCodecFilter {
    factory: Box<CodecFactory>,
}

impl ProtocolCodecFilter {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> (Box<dyn ProtocolEncoder>, Box<dyn ProtocolDecoder>) + Send + Sync + 'static,
    {
        ProtocolCodecFilter {
            factory: Box::new(factory),
        }
    }

    fn encoder(&self, session: &Arc<IoSession>) -> Arc<Mutex<Box<dyn ProtocolEncoder>>> {
        match session.get_attribute(&ENCODER_ATTR) {
            Some(encoder) => encoder,
            None => {
                self.install(session);
                session
                    .get_attribute(&ENCODER_ATTR)
                    .expect("codec installed")
            }
        }
    }

    fn decoder(&self, session: &Arc<IoSession>) -> Arc<Mutex<DecoderState>> {
        match session.get_attribute(&DECODER_ATTR) {
            Some(decoder) => decoder,
            None => {
                self.install(session);
                session
                    .get_attribute(&DECODER_ATTR)
                    .expect("codec installed")
            }
        }
    }

    fn install(&self, session: &Arc<IoSession>) {
        let (encoder, decoder) = (self.factory)();
        session.set_attribute(&ENCODER_ATTR, Mutex::new(encoder));
        session.set_attribute(
            &DECODER_ATTR,
            Mutex::new(DecoderState {
                decoder,
                leftover: Vec::new(),
            }),
        );
    }
}

impl IoFilter for ProtocolCodecFilter {
    fn session_created(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        // installed before any traffic, on the worker that created the
        // session, so later lookups never race
        self.install(session);
        next.session_created(session)
    }

    fn message_received(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        message: Message,
    ) -> Result<()> {
        let buffer = match message.downcast::<IoBuffer>() {
            Ok(buffer) => *buffer,
            Err(other) => return next.message_received(session, other),
        };
        let state = self.decoder(session);
        let decoded = {
            let mut state = state.lock().unwrap();
            let mut input = if state.leftover.is_empty() {
                buffer
            } else {
                let mut joined = std::mem::take(&mut state.leftover);
                joined.extend_from_slice(buffer.remaining_slice());
                IoBuffer::wrap(joined)
            };
            let mut out: Vec<Message> = Vec::new();
            let outcome = state.decoder.decode(session, &mut input, &mut out);
            if input.has_remaining() {
                state.leftover = input.remaining_slice().to_vec();
            }
            outcome?;
            out
            // lock released before forwarding so handlers may write back
        };
        for message in decoded {
            next.message_received(session, message)?;
        }
        Ok(())
    }

    fn filter_write(
        &self,
        next: &NextFilter<'_>,
        session: &Arc<IoSession>,
        mut request: WriteRequest,
    ) -> Result<()> {
        // raw buffers skip the encoder
        let already_raw = request
            .message()
            .map(|m| m.downcast_ref::<IoBuffer>().is_some())
            .unwrap_or(false);
        if !already_raw && request.encoded().is_none() {
            if let Some(message) = request.message() {
                let encoder = self.encoder(session);
                let mut buffers: Vec<IoBuffer> = Vec::new();
                encoder.lock().unwrap().encode(session, message, &mut buffers)?;
                request.set_encoded(merge(buffers));
            }
        }
        next.filter_write(session, request)
    }

    fn session_closed(&self, next: &NextFilter<'_>, session: &Arc<IoSession>) -> Result<()> {
        if let Some(state) = session.get_attribute(&DECODER_ATTR) {
            let remainder = {
                let mut state = state.lock().unwrap();
                let mut out: Vec<Message> = Vec::new();
                if let Err(cause) = state.decoder.finish_decode(session, &mut out) {
                    // the stream is gone; an incomplete trailing message is
                    // reported, not fatal
                    warn!(
                        "decoder could not finish on session {}: {}",
                        session.id(),
                        cause
                    );
                }
                state.decoder.dispose(session);
                out
            };
            for message in remainder {
                next.message_received(session, message)?;
            }
        }
        if let Some(encoder) = session.get_attribute(&ENCODER_ATTR) {
            encoder.lock().unwrap().dispose(session);
        }
        next.session_closed(session)
    }
}

fn merge(mut buffers: Vec<IoBuffer>) -> IoBuffer {
    if buffers.len() == 1 {
        return buffers.remove(0);
    }
    let total: usize = buffers.iter().map(|b| b.remaining()).sum();
    let mut joined = Vec::with_capacity(total);
    for buffer in &buffers {
        joined.extend_from_slice(buffer.remaining_slice());
    }
    IoBuffer::wrap(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_concatenates_remaining_regions() {
        let merged = merge(vec![
            IoBuffer::wrap(vec![1, 2]),
            IoBuffer::wrap(vec![3]),
            IoBuffer::wrap(vec![4, 5]),
        ]);
        assert_eq!(merged.remaining_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn merge_of_one_is_identity() {
        let merged = merge(vec![IoBuffer::wrap(vec![9, 9])]);
        assert_eq!(merged.remaining_slice(), &[9, 9]);
    }
}
