//! SentencePiece-compatible BPE vocabulary: binary load, greedy encode,
//! piece decode.
//!
//! The vocabulary file is `u32 max_token_length` followed by `vocab_size`
//! entries of `{f32 score, u32 len, len piece bytes}` in token-ID order.
//! IDs 0..=2 are reserved for `<unk>`, `<s>` and `</s>`; raw-byte fallback
//! tokens live at `byte + 3`.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use emberlm_core::{TokenId, TOK_BOS, TOK_EOS};

use crate::error::{ModelError, Result};

pub struct Vocabulary {
    pieces: Vec<Box<[u8]>>,
    scores: Vec<f32>,
    /// token IDs ordered by piece bytes, for binary-search lookup
    sorted: Vec<TokenId>,
    max_token_length: u32,
}

impl Vocabulary {
    /// Load the vocabulary file; `vocab_size` comes from the model config.
    pub fn load(path: &Path, vocab_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ModelError::Format(format!("couldn't open tokenizer {}: {e}", path.display()))
        })?;
        let mut r = BufReader::new(file);

        let max_token_length = r.read_u32::<LittleEndian>()?;

        let mut pieces = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            scores.push(r.read_f32::<LittleEndian>()?);
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut piece = vec![0u8; len];
            r.read_exact(&mut piece)?;
            pieces.push(piece.into_boxed_slice());
        }

        Ok(Self::from_parts(pieces, scores, max_token_length))
    }

    /// Build a vocabulary from in-memory entries (ID order).
    pub fn from_entries(entries: Vec<(Vec<u8>, f32)>) -> Self {
        let max_len = entries.iter().map(|(p, _)| p.len()).max().unwrap_or(0) as u32;
        let (pieces, scores) = entries
            .into_iter()
            .map(|(p, s)| (p.into_boxed_slice(), s))
            .unzip();
        Self::from_parts(pieces, scores, max_len)
    }

    fn from_parts(pieces: Vec<Box<[u8]>>, scores: Vec<f32>, max_token_length: u32) -> Self {
        let mut sorted: Vec<TokenId> = (0..pieces.len() as TokenId).collect();
        sorted.sort_unstable_by(|&a, &b| pieces[a as usize].cmp(&pieces[b as usize]));
        Self {
            pieces,
            scores,
            sorted,
            max_token_length,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn max_token_length(&self) -> u32 {
        self.max_token_length
    }

    /// Raw bytes of a token's piece.
    pub fn piece(&self, id: TokenId) -> &[u8] {
        &self.pieces[id as usize]
    }

    pub fn score(&self, id: TokenId) -> f32 {
        self.scores[id as usize]
    }

    fn lookup(&self, piece: &[u8]) -> Option<TokenId> {
        self.sorted
            .binary_search_by(|&id| self.pieces[id as usize].as_ref().cmp(piece))
            .ok()
            .map(|i| self.sorted[i])
    }

    /// Encode text with greedy highest-score BPE merging.
    ///
    /// A dummy " " prefix token is emitted for non-empty input (matching the
    /// upstream SentencePiece export this format comes from, even where that
    /// convention is debatable), unknown codepoints fall back to per-byte
    /// tokens at `byte + 3`, and on equal merge scores the earliest pair
    /// wins.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        let mut tokens: Vec<TokenId> = Vec::with_capacity(bytes.len() + 3);

        if bos {
            tokens.push(TOK_BOS);
        }

        if !bytes.is_empty() {
            match self.lookup(b" ") {
                Some(id) => tokens.push(id),
                None => tokens.push(b' ' as TokenId + 3),
            }
        }

        // gather the bytes of one codepoint, then look the piece up whole
        let mut buf: Vec<u8> = Vec::with_capacity(self.max_token_length as usize * 2 + 3);
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] & 0xC0 != 0x80 {
                buf.clear();
            }
            buf.push(bytes[i]);

            let next_is_continuation = i + 1 < bytes.len() && bytes[i + 1] & 0xC0 == 0x80;
            if next_is_continuation && buf.len() < 4 {
                i += 1;
                continue;
            }

            match self.lookup(&buf) {
                Some(id) => tokens.push(id),
                None => {
                    for &b in &buf {
                        tokens.push(b as TokenId + 3);
                    }
                }
            }
            buf.clear();
            i += 1;
        }

        // merge the best-scoring adjacent pair until none remains
        loop {
            let mut best_score = -1e10f32;
            let mut best: Option<(usize, TokenId)> = None;

            if tokens.len() > 2 {
                for idx in 0..tokens.len() - 1 {
                    buf.clear();
                    buf.extend_from_slice(self.piece(tokens[idx]));
                    buf.extend_from_slice(self.piece(tokens[idx + 1]));
                    if let Some(id) = self.lookup(&buf) {
                        if self.scores[id as usize] > best_score {
                            best_score = self.scores[id as usize];
                            best = Some((idx, id));
                        }
                    }
                }
            }

            match best {
                Some((idx, id)) => {
                    tokens[idx] = id;
                    tokens.remove(idx + 1);
                }
                None => break,
            }
        }

        if eos {
            tokens.push(TOK_EOS);
        }

        tokens
    }

    /// Decode one token in the context of the previous one.
    ///
    /// Following a BOS, a leading space is stripped (the inverse of the
    /// dummy-prefix prepend). Pieces made of `<0xHH>` escapes decode to
    /// their raw bytes.
    pub fn decode(&self, prev_token: TokenId, token: TokenId) -> Cow<'_, [u8]> {
        let mut piece = self.piece(token);
        if prev_token == TOK_BOS && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        match parse_byte_escapes(piece) {
            Some(bytes) => Cow::Owned(bytes),
            None => Cow::Borrowed(piece),
        }
    }
}

/// Parse a piece consisting entirely of `<0xHH[HH..]>` escape groups into
/// raw bytes (at most 16). Returns `None` for anything else, leaving the
/// piece to be emitted verbatim.
fn parse_byte_escapes(piece: &[u8]) -> Option<Vec<u8>> {
    if !piece.starts_with(b"<0x") {
        return None;
    }

    let mut out = Vec::with_capacity(4);
    let mut rest = piece;
    while !rest.is_empty() {
        rest = rest.strip_prefix(b"<0x")?;
        let end = rest.iter().position(|&b| b == b'>')?;
        let hex = &rest[..end];
        if hex.is_empty() || hex.len() % 2 != 0 || hex.len() > 8 {
            return None;
        }
        for pair in hex.chunks_exact(2) {
            out.push((hex_val(pair[0])? << 4) | hex_val(pair[1])?);
            if out.len() > 16 {
                return None;
            }
        }
        rest = &rest[end + 1..];
    }
    Some(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reserved entries, the 256 byte-fallback escapes, then extras; the
    /// same shape a real SentencePiece export has.
    fn test_vocab(extra: &[(&str, f32)]) -> Vocabulary {
        let mut entries: Vec<(Vec<u8>, f32)> = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
        ];
        for b in 0u16..256 {
            entries.push((format!("<0x{b:02X}>").into_bytes(), 0.0));
        }
        for (piece, score) in extra {
            entries.push((piece.as_bytes().to_vec(), *score));
        }
        Vocabulary::from_entries(entries)
    }

    #[test]
    fn merges_best_scoring_pair() {
        let v = test_vocab(&[(" ", 0.0), ("h", 0.0), ("i", 0.0), ("hi", 5.0)]);
        let tokens = v.encode("hi", false, false);
        assert_eq!(
            tokens,
            vec![v.lookup(b" ").unwrap(), v.lookup(b"hi").unwrap()]
        );
    }

    #[test]
    fn unknown_codepoint_falls_back_to_bytes() {
        let v = test_vocab(&[(" ", 0.0)]);
        // "©" is 0xC2 0xA9 and has no piece of its own
        let tokens = v.encode("\u{a9}", false, false);
        assert_eq!(
            tokens,
            vec![v.lookup(b" ").unwrap(), 0xC2 + 3, 0xA9 + 3]
        );
    }

    #[test]
    fn equal_scores_merge_earliest_pair_first() {
        let v = test_vocab(&[
            (" ", 0.0),
            ("a", 0.0),
            ("b", 0.0),
            ("ab", 1.0),
            ("bb", 1.0),
        ]);
        // "abb": both "ab" (at 1) and "bb" (at 2) score 1.0; the earlier
        // index must win, leaving ["ab", "b"] after the first merge
        let tokens = v.encode("abb", false, false);
        assert_eq!(
            tokens,
            vec![
                v.lookup(b" ").unwrap(),
                v.lookup(b"ab").unwrap(),
                v.lookup(b"b").unwrap()
            ]
        );
    }

    #[test]
    fn bos_and_eos_bracket_the_stream() {
        let v = test_vocab(&[(" ", 0.0), ("x", 0.0)]);
        let tokens = v.encode("x", true, true);
        assert_eq!(tokens[0], TOK_BOS);
        assert_eq!(*tokens.last().unwrap(), TOK_EOS);
    }

    #[test]
    fn empty_text_gets_no_dummy_prefix() {
        let v = test_vocab(&[(" ", 0.0)]);
        assert_eq!(v.encode("", true, false), vec![TOK_BOS]);
    }

    #[test]
    fn encode_is_deterministic() {
        let v = test_vocab(&[(" ", 0.5), ("a", 0.1), ("ab", 2.0), ("b", 0.1)]);
        let a = v.encode("abab", true, false);
        let b = v.encode("abab", true, false);
        assert_eq!(a, b);
    }

    #[test]
    fn decode_strips_space_after_bos() {
        let v = test_vocab(&[(" hello", 0.0)]);
        let id = v.lookup(b" hello").unwrap();
        assert_eq!(v.decode(TOK_BOS, id).as_ref(), b"hello");
        assert_eq!(v.decode(42, id).as_ref(), b" hello");
    }

    #[test]
    fn decode_expands_byte_escapes() {
        let v = test_vocab(&[("<0xE2><0x98><0x83>", 0.0)]);

        // snowman: 0xE2 0x98 0x83 as three escape groups in one piece
        let id = v.lookup(b"<0xE2><0x98><0x83>").unwrap();
        assert_eq!(v.decode(42, id).as_ref(), "\u{2603}".as_bytes());

        // single escape token decodes to its one byte
        let esc = v.lookup(b"<0xAB>").unwrap();
        assert_eq!(v.decode(42, esc).as_ref(), &[0xAB]);

        // non-escape pieces pass through untouched
        let s = v.lookup(b"<s>").unwrap();
        assert_eq!(v.decode(42, s).as_ref(), b"<s>");
    }

    #[test]
    fn round_trip_printable_ascii() {
        let mut extra: Vec<(String, f32)> = vec![(" ".to_string(), 0.0)];
        for b in 0x21u8..0x7F {
            extra.push(((b as char).to_string(), 0.0));
        }
        let refs: Vec<(&str, f32)> = extra.iter().map(|(s, f)| (s.as_str(), *f)).collect();
        let v = test_vocab(&refs);

        let text = "the quick brown fox";
        let tokens = v.encode(text, true, false);
        assert_eq!(tokens[0], TOK_BOS);

        let mut out = Vec::new();
        let mut prev = tokens[0];
        for &t in &tokens[1..] {
            out.extend_from_slice(v.decode(prev, t).as_ref());
            prev = t;
        }
        // decoding re-concatenated equals the input with the dummy prefix,
        // and the space after BOS is stripped again
        assert_eq!(out, text.as_bytes());
    }
}
