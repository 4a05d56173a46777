//! Incremental detokenization.
//!
//! Streams text out of a growing token-id list without ever flushing a
//! partially decoded multi-byte token: the decoded window is withheld while
//! it still ends in U+FFFD, and re-emitted once the remaining bytes arrive.

use crate::engine::sequence::Sequence;
use crate::engine::types::Token;
use crate::error::Result;
use crate::tokenizer::Tokenizer;

/// Tokens kept in front of the read window so context-sensitive decoders
/// see enough history.
const INITIAL_PREFIX_WINDOW: usize = 6;

#[derive(Debug)]
pub struct IncrementalDecode {
    /// Token strings appended by this call.
    pub new_tokens: Vec<String>,
    /// Text delta; empty while the window is incomplete.
    pub new_text: String,
    pub prefix_offset: usize,
    pub read_offset: usize,
}

/// Decode the newest token of `all_token_ids` against the accumulated
/// token-string state.
///
/// On the first call (`prev_tokens` is `None`) the whole id list is
/// converted and the offsets are initialised so that only text produced by
/// the newest token is emitted. Calling this step-by-step yields exactly
/// the one-shot decoding of the full list, modulo special-token removal.
pub fn detokenize_incrementally(
    tokenizer: &Tokenizer,
    all_token_ids: &[Token],
    prev_tokens: Option<&[String]>,
    prefix_offset: usize,
    read_offset: usize,
    skip_special_tokens: bool,
) -> Result<IncrementalDecode> {
    let (new_tokens, output_tokens, prefix_offset, read_offset) = match prev_tokens {
        None => {
            let new_tokens = tokenizer.ids_to_tokens(all_token_ids, skip_special_tokens);
            let len = new_tokens.len();
            (
                new_tokens.clone(),
                new_tokens,
                len.saturating_sub(INITIAL_PREFIX_WINDOW),
                len.saturating_sub(1),
            )
        }
        Some(prev) => {
            let last_id = all_token_ids.last().copied();
            let new_tokens = match last_id {
                Some(id) => tokenizer.ids_to_tokens(&[id], skip_special_tokens),
                None => Vec::new(),
            };
            let mut output_tokens = prev.to_vec();
            output_tokens.extend(new_tokens.iter().cloned());
            (new_tokens, output_tokens, prefix_offset, read_offset)
        }
    };

    let prefix_text = tokenizer.tokens_to_string(&output_tokens[prefix_offset..read_offset])?;
    let full_text = tokenizer.tokens_to_string(&output_tokens[prefix_offset..])?;

    if full_text.len() > prefix_text.len() && !full_text.ends_with('\u{FFFD}') {
        // The window decoded cleanly past what was already emitted.
        let new_text = full_text.chars().skip(prefix_text.chars().count()).collect();
        Ok(IncrementalDecode {
            new_tokens,
            new_text,
            prefix_offset: read_offset,
            read_offset: output_tokens.len(),
        })
    } else {
        Ok(IncrementalDecode {
            new_tokens,
            new_text: String::new(),
            prefix_offset,
            read_offset,
        })
    }
}

/// Advance a sequence's detokenizer state over its newest token.
pub(crate) fn decode_sequence(tokenizer: &Tokenizer, seq: &mut Sequence) -> Result<()> {
    let decoded = detokenize_incrementally(
        tokenizer,
        seq.get_token_ids(),
        seq.tokens.as_deref(),
        seq.prefix_offset,
        seq.read_offset,
        true,
    )?;
    match &mut seq.tokens {
        Some(tokens) => tokens.extend(decoded.new_tokens),
        None => seq.tokens = Some(decoded.new_tokens),
    }
    seq.prefix_offset = decoded.prefix_offset;
    seq.read_offset = decoded.read_offset;
    seq.output_text.push_str(&decoded.new_text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::test_support::word_tokenizer;

    fn drive(tokenizer: &Tokenizer, prompt: &[Token], generated: &[Token]) -> String {
        let mut all = prompt.to_vec();
        let mut tokens: Option<Vec<String>> = None;
        let mut prefix_offset = 0;
        let mut read_offset = 0;
        let mut text = String::new();

        for id in generated {
            all.push(*id);
            let decoded = detokenize_incrementally(
                tokenizer,
                &all,
                tokens.as_deref(),
                prefix_offset,
                read_offset,
                true,
            )
            .unwrap();
            match &mut tokens {
                Some(t) => t.extend(decoded.new_tokens),
                None => tokens = Some(decoded.new_tokens),
            }
            prefix_offset = decoded.prefix_offset;
            read_offset = decoded.read_offset;
            text.push_str(&decoded.new_text);
        }
        text
    }

    #[test]
    fn streams_word_deltas() {
        let tok = word_tokenizer(&[("The", 1), ("quick", 2), ("fox", 3)], None);
        let text = drive(&tok, &[1], &[2, 3]);
        assert_eq!(text, " quick fox");
    }

    #[test]
    fn glued_tokens_attach() {
        let tok = word_tokenizer(&[("The", 1), ("quick", 2), ("fox", 3), ("##END", 4)], None);
        let text = drive(&tok, &[1], &[2, 3, 4]);
        assert_eq!(text, " quick foxEND");
    }

    #[test]
    fn round_trip_matches_one_shot_decode() {
        let vocab: Vec<(String, Token)> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as Token + 1))
            .collect();
        let entries: Vec<(&str, Token)> = vocab.iter().map(|(s, id)| (s.as_str(), *id)).collect();
        let tok = word_tokenizer(&entries, None);

        let prompt = [1, 2];
        let generated = [3, 4, 5, 6, 7, 8];
        let incremental = drive(&tok, &prompt, &generated);

        let one_shot = tok.decode(&generated, true).unwrap();
        // The streamed text keeps the joining space in front of the first
        // generated token; everything after matches the one-shot decode.
        assert_eq!(incremental, format!(" {one_shot}"));
    }

    #[test]
    fn special_tokens_yield_no_text() {
        let eos = 9;
        let tok = word_tokenizer(&[("The", 1), ("quick", 2)], Some(eos));
        let text = drive(&tok, &[1], &[2, eos]);
        assert_eq!(text, " quick");
    }
}
