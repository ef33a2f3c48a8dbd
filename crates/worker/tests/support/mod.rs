//! Scripted in-memory engine shared by the integration tests.
//!
//! The "model" is a transition table: after evaluating a batch, the top
//! scoring token is whatever follows the last score-requesting entry.
//! Unlisted tokens are followed by end-of-sequence.

#![allow(dead_code)]

use llmpipe_common::{LlmPipeError, Result};
use llmpipe_proto::encode_frame;
use llmpipe_worker::{InferenceBackend, Position, SequenceId, TokenId};
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

pub const UNK: TokenId = 0;
pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const HELLO: TokenId = 3;
pub const HI: TokenId = 4;
pub const THERE: TokenId = 5;
pub const BANG: TokenId = 6;
pub const BAD: TokenId = 7;

/// Token pieces, indexed by id. `<unk>` renders as nothing.
const VOCAB: &[&str] = &["", "<s>", "</s>", "Hello", " Hi", " there", "!", "<bad>"];

/// Extra score entries past the vocabulary, set higher than any real score
const SCORE_PADDING: usize = 2;

/// Prompt word that makes tokenization fail
pub const FAIL_WORD: &str = "FAIL_TOKENIZE";

/// Prompt word that makes the engine fail outside tokenization and evaluation
pub const BROKEN_WORD: &str = "BROKEN_ENGINE";

/// Prompt word that expands to more tokens than any prompt capacity allows
pub const EXPAND_WORD: &str = "EXPAND";
const EXPAND_TOKENS: usize = 64;

/// One batch entry as handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub token: TokenId,
    pub position: Position,
    pub sequence: SequenceId,
    pub want_scores: bool,
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    transitions: HashMap<TokenId, TokenId>,
    fail_on: HashSet<TokenId>,
    add_bos: bool,
    scores: Vec<f32>,

    /// Every batch passed to `evaluate`, failed ones included
    pub evaluated: Vec<Vec<Entry>>,
    pub created: usize,
    pub released: usize,
    live: usize,
    pub max_live: usize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            add_bos: true,
            ..Default::default()
        }
    }

    /// After evaluating `from`, score `to` highest
    pub fn with_transition(mut self, from: TokenId, to: TokenId) -> Self {
        self.transitions.insert(from, to);
        self
    }

    /// Fail any evaluation whose batch contains `token`
    pub fn failing_on(mut self, token: TokenId) -> Self {
        self.fail_on.insert(token);
        self
    }

    /// Tokenize without a begin-of-sequence marker, whatever the caller asks
    pub fn without_bos(mut self) -> Self {
        self.add_bos = false;
        self
    }

    fn lookup(word: &str) -> TokenId {
        VOCAB
            .iter()
            .position(|piece| !piece.is_empty() && piece.trim() == word)
            .map(|i| i as TokenId)
            .unwrap_or(UNK)
    }
}

impl InferenceBackend for FakeEngine {
    type Batch = Vec<Entry>;

    fn vocab_size(&self) -> usize {
        VOCAB.len()
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn tokenize(&self, text: &str, add_bos: bool, capacity: usize) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_bos && self.add_bos {
            tokens.push(BOS);
        }

        for word in text.split_whitespace() {
            match word {
                FAIL_WORD => return Err(LlmPipeError::tokenization("unsupported word")),
                BROKEN_WORD => return Err(LlmPipeError::internal("engine state lost")),
                EXPAND_WORD => tokens.extend(std::iter::repeat(HELLO).take(EXPAND_TOKENS)),
                _ => tokens.push(Self::lookup(word)),
            }
        }

        if tokens.len() > capacity {
            return Err(LlmPipeError::capacity(tokens.len(), capacity));
        }
        Ok(tokens)
    }

    fn new_batch(&mut self, capacity: usize) -> Self::Batch {
        self.created += 1;
        self.live += 1;
        self.max_live = self.max_live.max(self.live);
        Vec::with_capacity(capacity)
    }

    fn add_to_batch(
        &self,
        batch: &mut Self::Batch,
        token: TokenId,
        position: Position,
        sequence: SequenceId,
        want_scores: bool,
    ) -> Result<()> {
        batch.push(Entry {
            token,
            position,
            sequence,
            want_scores,
        });
        Ok(())
    }

    fn evaluate(&mut self, batch: &mut Self::Batch) -> Result<()> {
        self.evaluated.push(batch.clone());

        if let Some(entry) = batch.iter().find(|e| self.fail_on.contains(&e.token)) {
            return Err(LlmPipeError::decode(format!("cannot evaluate token {}", entry.token)));
        }

        self.scores = match batch.iter().rev().find(|e| e.want_scores) {
            Some(entry) => {
                let next = self.transitions.get(&entry.token).copied().unwrap_or(EOS);
                let mut scores = vec![0.0; VOCAB.len()];
                scores[next as usize] = 1.0;
                scores.extend(std::iter::repeat(10.0).take(SCORE_PADDING));
                scores
            }
            None => Vec::new(),
        };
        Ok(())
    }

    fn release_batch(&mut self, _batch: Self::Batch) {
        self.released += 1;
        self.live -= 1;
    }

    fn scores(&self) -> &[f32] {
        &self.scores
    }

    fn token_to_piece(&self, token: TokenId, capacity: usize) -> Result<Vec<u8>> {
        let piece = usize::try_from(token)
            .ok()
            .and_then(|i| VOCAB.get(i))
            .ok_or_else(|| LlmPipeError::tokenization(format!("unknown token {}", token)))?;

        let piece = match token {
            BOS | EOS => "",
            _ => piece,
        };
        if piece.len() > capacity {
            return Err(LlmPipeError::capacity(piece.len(), capacity));
        }
        Ok(piece.as_bytes().to_vec())
    }
}

/// Writer that accepts `limit` bytes and then fails every write
pub struct FailAfter {
    pub written: Vec<u8>,
    limit: usize,
}

impl FailAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            written: Vec::new(),
            limit,
        }
    }
}

impl AsyncWrite for FailAfter {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let room = self.limit - self.written.len();
        if room == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
        }
        let n = room.min(buf.len());
        self.written.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Encode prompts as one input stream
pub fn frames(prompts: &[&[u8]]) -> Vec<u8> {
    prompts
        .iter()
        .flat_map(|prompt| encode_frame(prompt).unwrap())
        .collect()
}

/// Split worker output into the handshake line and the framed responses
pub fn parse_output(output: &[u8]) -> (String, Vec<Vec<u8>>) {
    let newline = output
        .iter()
        .position(|&b| b == b'\n')
        .expect("output should start with a handshake line");
    let handshake = String::from_utf8(output[..newline].to_vec()).unwrap();

    let mut rest = &output[newline + 1..];
    let mut responses = Vec::new();
    while !rest.is_empty() {
        let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        responses.push(rest[4..4 + len].to_vec());
        rest = &rest[4 + len..];
    }
    (handshake, responses)
}
