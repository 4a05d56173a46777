//! Tokenizer access for the engine core.
//!
//! The engine does not implement tokenization; it wraps an HF `tokenizers`
//! instance and exposes the handful of operations the detokenizer and stop
//! checks need: id/token conversion, decoding, and the special-token table.

use std::path::Path;

use tokenizers::{Decoder, Tokenizer as HfTokenizer};
use tracing::debug;

use crate::engine::types::Token;
use crate::error::{Error, Result};

/// Eos candidates probed when the tokenizer file does not advertise one.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>"];

#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    pub bos_id: Option<Token>,
    pub eos_id: Option<Token>,
    pub pad_id: Option<Token>,
}

pub struct Tokenizer {
    inner: HfTokenizer,
    special_tokens: SpecialTokens,
}

impl Tokenizer {
    pub fn from_path(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        let inner = HfTokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        debug!("Loaded tokenizer from {:?}", tokenizer_path);

        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|candidate| inner.token_to_id(candidate));
        let special_tokens = SpecialTokens {
            bos_id: None,
            eos_id,
            pad_id: None,
        };
        Ok(Self::from_hf(inner, special_tokens))
    }

    /// Wrap an already-built tokenizer with an explicit special-token table.
    pub fn from_hf(inner: HfTokenizer, special_tokens: SpecialTokens) -> Self {
        Self {
            inner,
            special_tokens,
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<Token>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[Token], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    pub fn id_to_token(&self, id: Token) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// Convert ids to token strings, optionally dropping special tokens.
    /// Ids outside the vocabulary are skipped.
    pub fn ids_to_tokens(&self, ids: &[Token], skip_special_tokens: bool) -> Vec<String> {
        ids.iter()
            .filter(|id| !(skip_special_tokens && self.is_special(**id)))
            .filter_map(|id| self.id_to_token(*id))
            .collect()
    }

    /// Join token strings into text through the tokenizer's decoder.
    pub fn tokens_to_string(&self, tokens: &[String]) -> Result<String> {
        if tokens.is_empty() {
            return Ok(String::new());
        }
        match self.inner.get_decoder() {
            Some(decoder) => decoder
                .decode(tokens.to_vec())
                .map_err(|e| Error::Tokenization(e.to_string())),
            None => Ok(tokens.join(" ")),
        }
    }

    pub fn eos_token_id(&self) -> Option<Token> {
        self.special_tokens.eos_id
    }

    pub fn is_special(&self, id: Token) -> bool {
        [
            self.special_tokens.bos_id,
            self.special_tokens.eos_id,
            self.special_tokens.pad_id,
        ]
        .iter()
        .any(|special| *special == Some(id))
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use tokenizers::decoders::wordpiece::WordPiece;
    use tokenizers::models::wordlevel::WordLevel;

    use super::*;

    /// Build an in-memory word-level tokenizer for tests.
    ///
    /// Tokens prefixed with `##` glue to the previous token when decoded;
    /// everything else is joined with a space.
    pub(crate) fn word_tokenizer(entries: &[(&str, Token)], eos_id: Option<Token>) -> Tokenizer {
        let mut vocab: HashMap<String, Token> =
            entries.iter().map(|(s, id)| (s.to_string(), *id)).collect();
        vocab.entry("<unk>".to_string()).or_insert(0);
        if let Some(eos) = eos_id {
            vocab.entry("</s>".to_string()).or_insert(eos);
        }

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut inner = HfTokenizer::new(model);
        let mut decoder = WordPiece::default();
        decoder.cleanup = false;
        inner.with_decoder(decoder);

        Tokenizer::from_hf(
            inner,
            SpecialTokens {
                bos_id: None,
                eos_id,
                pad_id: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::word_tokenizer;

    #[test]
    fn decode_joins_words() {
        let tok = word_tokenizer(&[("The", 1), ("quick", 2), ("fox", 3)], None);
        assert_eq!(
            tok.tokens_to_string(&["The".into(), "quick".into()]).unwrap(),
            "The quick"
        );
    }

    #[test]
    fn glued_tokens_attach_without_space() {
        let tok = word_tokenizer(&[("fox", 3), ("##END", 4)], None);
        assert_eq!(
            tok.tokens_to_string(&["fox".into(), "##END".into()]).unwrap(),
            "foxEND"
        );
    }

    #[test]
    fn special_tokens_skipped_in_conversion() {
        let tok = word_tokenizer(&[("a", 1), ("b", 2)], Some(9));
        assert!(tok.is_special(9));
        assert_eq!(tok.ids_to_tokens(&[1, 9, 2], true), vec!["a", "b"]);
    }
}
