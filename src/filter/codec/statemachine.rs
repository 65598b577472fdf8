//! Composable decoding states: protocol parsers assembled from small
//! byte-consuming nodes.
//!
//! A [`DecodingState`] consumes input incrementally and names its successor;
//! a [`DecodingStateMachine`] drives a graph of states and is itself a state,
//! so machines nest. The substrate guarantees forward progress on every
//! non-empty input and buffers no more than the current state requires, which
//! is what makes decoders indifferent to how the byte stream is fragmented.

use std::mem;

use log::{debug, warn};

use super::{DecoderOutput, ProtocolDecoder};
use crate::buffer::IoBuffer;
use crate::error::{Error, Result};
use crate::session::IoSession;
use crate::Message;
use std::sync::Arc;

/// Outcome of feeding bytes to a state.
pub enum NextState {
    /// Same state; more input is needed.
    Stay,
    /// Move to another state.
    Transition(Box<dyn DecodingState>),
    /// The surrounding state machine is complete.
    End,
}

/// One node of an incremental parser.
pub trait DecodingState: Send {
    /// Consumes zero or more bytes from `input`, writes zero or more decoded
    /// messages to `out`, and names the next state.
    ///
    /// `Err` means the input violated the protocol; "not enough bytes yet"
    /// is `Ok(NextState::Stay)`, never an error.
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState>;

    /// Called when the input ends while this state is current.
    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof("input ended mid-message"))
    }
}

/// Decodes exactly one byte, then delegates to the callback for the
/// transition.
pub struct SingleByteDecodingState<F> {
    on_byte: F,
}

impl<F> SingleByteDecodingState<F>
where
    F: FnMut(u8, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(on_byte: F) -> Self {
        SingleByteDecodingState { on_byte }
    }
}

impl<F> DecodingState for SingleByteDecodingState<F>
where
    F: FnMut(u8, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        if input.has_remaining() {
            let b = input.get()?;
            (self.on_byte)(b, out)
        } else {
            Ok(NextState::Stay)
        }
    }

    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof(
            "end of session while waiting for a single byte",
        ))
    }
}

/// Decodes a big-endian `u16`, buffering across fragments.
pub struct U16BeDecodingState<F> {
    acc: u64,
    count: u8,
    on_value: F,
}

impl<F> U16BeDecodingState<F>
where
    F: FnMut(u16, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(on_value: F) -> Self {
        U16BeDecodingState {
            acc: 0,
            count: 0,
            on_value,
        }
    }
}

impl<F> DecodingState for U16BeDecodingState<F>
where
    F: FnMut(u16, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        while self.count < 2 {
            if !input.has_remaining() {
                return Ok(NextState::Stay);
            }
            self.acc = self.acc << 8 | u64::from(input.get()?);
            self.count += 1;
        }
        let value = self.acc as u16;
        self.acc = 0;
        self.count = 0;
        (self.on_value)(value, out)
    }

    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof(
            "end of session while waiting for a 2-byte integer",
        ))
    }
}

/// Decodes a big-endian `u32`, buffering across fragments.
pub struct U32BeDecodingState<F> {
    acc: u64,
    count: u8,
    on_value: F,
}

impl<F> U32BeDecodingState<F>
where
    F: FnMut(u32, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(on_value: F) -> Self {
        U32BeDecodingState {
            acc: 0,
            count: 0,
            on_value,
        }
    }
}

impl<F> DecodingState for U32BeDecodingState<F>
where
    F: FnMut(u32, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        while self.count < 4 {
            if !input.has_remaining() {
                return Ok(NextState::Stay);
            }
            self.acc = self.acc << 8 | u64::from(input.get()?);
            self.count += 1;
        }
        let value = self.acc as u32;
        self.acc = 0;
        self.count = 0;
        (self.on_value)(value, out)
    }

    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof(
            "end of session while waiting for a 4-byte integer",
        ))
    }
}

/// Decodes a big-endian `u64`, buffering across fragments.
pub struct U64BeDecodingState<F> {
    acc: u64,
    count: u8,
    on_value: F,
}

impl<F> U64BeDecodingState<F>
where
    F: FnMut(u64, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(on_value: F) -> Self {
        U64BeDecodingState {
            acc: 0,
            count: 0,
            on_value,
        }
    }
}

impl<F> DecodingState for U64BeDecodingState<F>
where
    F: FnMut(u64, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        while self.count < 8 {
            if !input.has_remaining() {
                return Ok(NextState::Stay);
            }
            self.acc = self.acc << 8 | u64::from(input.get()?);
            self.count += 1;
        }
        let value = self.acc;
        self.acc = 0;
        self.count = 0;
        (self.on_value)(value, out)
    }

    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof(
            "end of session while waiting for an 8-byte integer",
        ))
    }
}

/// Collects exactly `length` bytes, then hands the completed region to the
/// callback.
pub struct FixedLengthDecodingState<F> {
    length: usize,
    collected: Vec<u8>,
    on_complete: F,
}

impl<F> FixedLengthDecodingState<F>
where
    F: FnMut(IoBuffer, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(length: usize, on_complete: F) -> Self {
        FixedLengthDecodingState {
            length,
            collected: Vec::with_capacity(length),
            on_complete,
        }
    }
}

impl<F> DecodingState for FixedLengthDecodingState<F>
where
    F: FnMut(IoBuffer, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        let missing = self.length - self.collected.len();
        let take = missing.min(input.remaining());
        let mut chunk = vec![0u8; take];
        input.read_into(&mut chunk);
        self.collected.extend_from_slice(&chunk);
        if self.collected.len() == self.length {
            let product = IoBuffer::wrap(mem::take(&mut self.collected));
            (self.on_complete)(product, out)
        } else {
            Ok(NextState::Stay)
        }
    }

    fn finish_decode(&mut self, _out: &mut dyn DecoderOutput) -> Result<NextState> {
        Err(Error::unexpected_eof(format!(
            "end of session with {} of {} fixed-length bytes read",
            self.collected.len(),
            self.length
        )))
    }
}

/// Collects bytes up to (and excluding) a terminator byte, then hands the
/// region to the callback. At end of input, whatever was collected is
/// delivered as the final product.
pub struct ConsumeToTerminatorDecodingState<F> {
    terminator: u8,
    collected: Vec<u8>,
    on_complete: F,
}

impl<F> ConsumeToTerminatorDecodingState<F>
where
    F: FnMut(IoBuffer, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    pub fn new(terminator: u8, on_complete: F) -> Self {
        ConsumeToTerminatorDecodingState {
            terminator,
            collected: Vec::new(),
            on_complete,
        }
    }
}

impl<F> DecodingState for ConsumeToTerminatorDecodingState<F>
where
    F: FnMut(IoBuffer, &mut dyn DecoderOutput) -> Result<NextState> + Send,
{
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        while input.has_remaining() {
            let b = input.get()?;
            if b == self.terminator {
                let product = IoBuffer::wrap(mem::take(&mut self.collected));
                return (self.on_complete)(product, out);
            }
            self.collected.push(b);
        }
        Ok(NextState::Stay)
    }

    fn finish_decode(&mut self, out: &mut dyn DecoderOutput) -> Result<NextState> {
        let product = IoBuffer::wrap(mem::take(&mut self.collected));
        (self.on_complete)(product, out)
    }
}

/// Supplies a [`DecodingStateMachine`] with its start state and end-of-run
/// behavior.
pub trait StateMachineDriver: Send {
    /// The start state. Called once per run; not called again until the
    /// machine has been destroyed.
    fn init(&mut self) -> Result<Box<dyn DecodingState>>;

    /// Called when the machine reaches its end state. `products` holds every
    /// message the inner states produced during the run; the driver decides
    /// what reaches the real output and names the enclosing machine's next
    /// state (`End` when it, too, is finished).
    fn finish(&mut self, products: Vec<Message>, out: &mut dyn DecoderOutput)
        -> Result<NextState>;

    /// Called once per `init` when the run ends or fails.
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives a graph of [`DecodingState`]s and is itself a state, so machines
/// compose.
///
/// Messages written by inner states are withheld in a product list until the
/// machine completes; the driver's `finish` then decides what the outer
/// output sees. Invariants: `init` and `destroy` pair exactly; the decode
/// loop exits when input is exhausted or when a pass makes no progress (same
/// state, no bytes consumed); a failed `destroy` is logged and never masks
/// the primary error.
pub struct DecodingStateMachine {
    driver: Box<dyn StateMachineDriver>,
    current: Option<Box<dyn DecodingState>>,
    products: Vec<Message>,
    initialized: bool,
}

impl DecodingStateMachine {
    pub fn new(driver: impl StateMachineDriver + 'static) -> Self {
        DecodingStateMachine {
            driver: Box::new(driver),
            current: None,
            products: Vec::new(),
            initialized: false,
        }
    }

    /// Whether a run is in progress (a message is partially decoded).
    pub fn is_started(&self) -> bool {
        self.initialized
    }

    fn start_state(&mut self) -> Result<Box<dyn DecodingState>> {
        match self.current.take() {
            Some(state) => Ok(state),
            None => {
                let state = self.driver.init()?;
                self.initialized = true;
                Ok(state)
            }
        }
    }

    fn cleanup(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;
        self.products.clear();
        self.current = None;
        if let Err(cause) = self.driver.destroy() {
            warn!("failed to destroy a decoding state machine: {}", cause);
        }
    }
}

impl DecodingState for DecodingStateMachine {
    fn decode(&mut self, input: &mut IoBuffer, out: &mut dyn DecoderOutput) -> Result<NextState> {
        let mut state = self.start_state()?;
        loop {
            if !input.has_remaining() {
                self.current = Some(state);
                return Ok(NextState::Stay);
            }
            let pos = input.position();
            match state.decode(input, &mut self.products) {
                Ok(NextState::End) => {
                    let products = mem::take(&mut self.products);
                    let next = self.driver.finish(products, out);
                    self.cleanup();
                    return next;
                }
                Ok(NextState::Stay) => {
                    if input.position() == pos {
                        // no bytes consumed and no transition: park until
                        // more input arrives
                        self.current = Some(state);
                        return Ok(NextState::Stay);
                    }
                }
                Ok(NextState::Transition(successor)) => {
                    state = successor;
                }
                Err(cause) => {
                    self.cleanup();
                    return Err(cause);
                }
            }
        }
    }

    fn finish_decode(&mut self, out: &mut dyn DecoderOutput) -> Result<NextState> {
        let mut state = Some(self.start_state()?);
        loop {
            let Some(mut current) = state.take() else {
                break;
            };
            match current.finish_decode(&mut self.products) {
                Ok(NextState::End) => break,
                Ok(NextState::Stay) => {
                    state = Some(current);
                    break;
                }
                Ok(NextState::Transition(successor)) => {
                    state = Some(successor);
                }
                Err(cause) => {
                    // the session is going away; trailing garbage is noise
                    debug!("ignoring decode failure at end of input: {}", cause);
                    break;
                }
            }
        }
        let products = mem::take(&mut self.products);
        let next = self.driver.finish(products, out);
        self.current = state;
        if self.current.is_none() {
            self.cleanup();
        }
        next
    }
}

/// Adapts a [`DecodingStateMachine`] into a [`ProtocolDecoder`], restarting
/// the machine after each completed run while input remains.
pub struct StateMachineProtocolDecoder {
    machine: DecodingStateMachine,
}

impl StateMachineProtocolDecoder {
    pub fn new(machine: DecodingStateMachine) -> Self {
        StateMachineProtocolDecoder { machine }
    }
}

impl ProtocolDecoder for StateMachineProtocolDecoder {
    fn decode(
        &mut self,
        _session: &Arc<IoSession>,
        input: &mut IoBuffer,
        out: &mut dyn DecoderOutput,
    ) -> Result<()> {
        while input.has_remaining() {
            let pos = input.position();
            match self.machine.decode(input, out)? {
                // a run finished; the loop restarts the machine on leftover bytes
                NextState::End => {}
                _ => {
                    if input.position() == pos {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish_decode(
        &mut self,
        _session: &Arc<IoSession>,
        out: &mut dyn DecoderOutput,
    ) -> Result<()> {
        if self.machine.is_started() {
            self.machine.finish_decode(out).map(|_| ())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Length-prefixed frames: a 4-byte big-endian length, then that many
    /// body bytes delivered as one message.
    struct LengthPrefixDriver {
        inits: Arc<AtomicUsize>,
        destroys: Arc<AtomicUsize>,
    }

    impl LengthPrefixDriver {
        fn counted(inits: Arc<AtomicUsize>, destroys: Arc<AtomicUsize>) -> Self {
            LengthPrefixDriver { inits, destroys }
        }

        fn plain() -> Self {
            LengthPrefixDriver {
                inits: Arc::new(AtomicUsize::new(0)),
                destroys: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl StateMachineDriver for LengthPrefixDriver {
        fn init(&mut self) -> Result<Box<dyn DecodingState>> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(U32BeDecodingState::new(|length, _out| {
                Ok(NextState::Transition(Box::new(
                    FixedLengthDecodingState::new(length as usize, |body, out| {
                        out.write(Box::new(body));
                        Ok(NextState::End)
                    }),
                )))
            })))
        }

        fn finish(
            &mut self,
            products: Vec<Message>,
            out: &mut dyn DecoderOutput,
        ) -> Result<NextState> {
            for product in products {
                out.write(product);
            }
            Ok(NextState::End)
        }

        fn destroy(&mut self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn decode_stream(machine: &mut DecodingStateMachine, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut out: Vec<Message> = Vec::new();
        for chunk in chunks {
            let mut input = IoBuffer::wrap(chunk.to_vec());
            loop {
                if !input.has_remaining() {
                    break;
                }
                let pos = input.position();
                match machine.decode(&mut input, &mut out).unwrap() {
                    NextState::End => continue,
                    _ => {
                        if input.position() == pos {
                            break;
                        }
                    }
                }
            }
        }
        out.into_iter()
            .map(|m| {
                m.downcast::<IoBuffer>()
                    .unwrap()
                    .remaining_slice()
                    .to_vec()
            })
            .collect()
    }

    const STREAM: &[u8] = &[
        0x00, 0x00, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f, // "hello"
        0x00, 0x00, 0x00, 0x03, 0x61, 0x62, 0x63, // "abc"
    ];

    #[test]
    fn length_prefixed_messages_whole_stream() {
        let mut machine = DecodingStateMachine::new(LengthPrefixDriver::plain());
        let messages = decode_stream(&mut machine, &[STREAM]);
        assert_eq!(messages, vec![b"hello".to_vec(), b"abc".to_vec()]);
    }

    #[test]
    fn length_prefixed_messages_one_byte_at_a_time() {
        let mut machine = DecodingStateMachine::new(LengthPrefixDriver::plain());
        let chunks: Vec<&[u8]> = STREAM.chunks(1).collect();
        let messages = decode_stream(&mut machine, &chunks);
        assert_eq!(messages, vec![b"hello".to_vec(), b"abc".to_vec()]);
    }

    #[test]
    fn fragmentation_does_not_change_output() {
        for chunk_size in 1..=STREAM.len() {
            let mut machine = DecodingStateMachine::new(LengthPrefixDriver::plain());
            let chunks: Vec<&[u8]> = STREAM.chunks(chunk_size).collect();
            let messages = decode_stream(&mut machine, &chunks);
            assert_eq!(
                messages,
                vec![b"hello".to_vec(), b"abc".to_vec()],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn destroy_pairs_with_init() {
        let inits = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));
        let mut machine = DecodingStateMachine::new(LengthPrefixDriver::counted(
            Arc::clone(&inits),
            Arc::clone(&destroys),
        ));
        decode_stream(&mut machine, &[STREAM]);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        assert!(!machine.is_started());
    }

    #[test]
    fn partial_message_keeps_the_machine_started() {
        let mut machine = DecodingStateMachine::new(LengthPrefixDriver::plain());
        let messages = decode_stream(&mut machine, &[&STREAM[..6]]);
        assert!(messages.is_empty());
        assert!(machine.is_started());
    }

    #[test]
    fn finish_decode_reports_truncation() {
        let mut machine = DecodingStateMachine::new(LengthPrefixDriver::plain());
        let mut out: Vec<Message> = Vec::new();
        let mut input = IoBuffer::wrap(STREAM[..6].to_vec());
        machine.decode(&mut input, &mut out).unwrap();
        // input ended with 2 of 5 body bytes: the fixed-length state refuses
        let mut end_out: Vec<Message> = Vec::new();
        machine.finish_decode(&mut end_out).unwrap();
        assert!(end_out.is_empty());
        assert!(!machine.is_started());
    }

    #[test]
    fn single_byte_state_consumes_exactly_one() {
        let mut state = SingleByteDecodingState::new(|b, out| {
            out.write(Box::new(b));
            Ok(NextState::End)
        });
        let mut out: Vec<Message> = Vec::new();
        let mut empty = IoBuffer::wrap(vec![]);
        assert!(matches!(
            state.decode(&mut empty, &mut out).unwrap(),
            NextState::Stay
        ));
        let mut input = IoBuffer::wrap(vec![0x41, 0x42]);
        assert!(matches!(
            state.decode(&mut input, &mut out).unwrap(),
            NextState::End
        ));
        assert_eq!(input.remaining(), 1);
        assert!(matches!(
            state.finish_decode(&mut out),
            Err(Error::UnexpectedEof(_))
        ));
    }

    #[test]
    fn terminator_state_delivers_collected_bytes_at_eof() {
        let mut state = ConsumeToTerminatorDecodingState::new(b'\n', |line, out| {
            out.write(Box::new(line));
            Ok(NextState::End)
        });
        let mut out: Vec<Message> = Vec::new();
        let mut input = IoBuffer::wrap(b"partial".to_vec());
        assert!(matches!(
            state.decode(&mut input, &mut out).unwrap(),
            NextState::Stay
        ));
        state.finish_decode(&mut out).unwrap();
        let line = out.remove(0).downcast::<IoBuffer>().unwrap();
        assert_eq!(line.remaining_slice(), b"partial");
    }

    #[test]
    fn terminator_state_splits_on_the_delimiter() {
        let mut state = ConsumeToTerminatorDecodingState::new(b'\n', |line, out| {
            out.write(Box::new(line));
            Ok(NextState::End)
        });
        let mut out: Vec<Message> = Vec::new();
        let mut input = IoBuffer::wrap(b"one\nrest".to_vec());
        assert!(matches!(
            state.decode(&mut input, &mut out).unwrap(),
            NextState::End
        ));
        assert_eq!(input.remaining_slice(), b"rest");
        let line = out.remove(0).downcast::<IoBuffer>().unwrap();
        assert_eq!(line.remaining_slice(), b"one");
    }

    #[test]
    fn u16_state_buffers_across_fragments() {
        let mut state = U16BeDecodingState::new(|value, out| {
            out.write(Box::new(value));
            Ok(NextState::End)
        });
        let mut out: Vec<Message> = Vec::new();
        let mut first = IoBuffer::wrap(vec![0xBE]);
        assert!(matches!(
            state.decode(&mut first, &mut out).unwrap(),
            NextState::Stay
        ));
        let mut second = IoBuffer::wrap(vec![0xEF]);
        assert!(matches!(
            state.decode(&mut second, &mut out).unwrap(),
            NextState::End
        ));
        assert_eq!(out.remove(0).downcast::<u16>().unwrap(), Box::new(0xBEEF));
    }

    #[test]
    fn u64_state_decodes_big_endian() {
        let mut state = U64BeDecodingState::new(|value, out| {
            out.write(Box::new(value));
            Ok(NextState::End)
        });
        let mut out: Vec<Message> = Vec::new();
        let mut input = IoBuffer::wrap(0x0102_0304_0506_0708u64.to_be_bytes().to_vec());
        assert!(matches!(
            state.decode(&mut input, &mut out).unwrap(),
            NextState::End
        ));
        assert_eq!(
            out.remove(0).downcast::<u64>().unwrap(),
            Box::new(0x0102_0304_0506_0708)
        );
    }

    /// A driver whose start state errors on a sentinel byte: the machine must
    /// clean up exactly once and surface the failure.
    struct RejectingDriver {
        destroys: Arc<AtomicUsize>,
    }

    impl StateMachineDriver for RejectingDriver {
        fn init(&mut self) -> Result<Box<dyn DecodingState>> {
            Ok(Box::new(SingleByteDecodingState::new(|b, _out| {
                if b == 0xFF {
                    Err(Error::decoder("sentinel byte is not allowed"))
                } else {
                    Ok(NextState::End)
                }
            })))
        }

        fn finish(
            &mut self,
            _products: Vec<Message>,
            _out: &mut dyn DecoderOutput,
        ) -> Result<NextState> {
            Ok(NextState::End)
        }

        fn destroy(&mut self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn decode_failure_cleans_up_and_propagates() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let mut machine = DecodingStateMachine::new(RejectingDriver {
            destroys: Arc::clone(&destroys),
        });
        let mut out: Vec<Message> = Vec::new();
        let mut input = IoBuffer::wrap(vec![0xFF]);
        assert!(matches!(
            machine.decode(&mut input, &mut out),
            Err(Error::Decoder(_))
        ));
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert!(!machine.is_started());
    }
}
