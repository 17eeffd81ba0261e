use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

pub const START_OF_TEXT: &str = "<|startoftext|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Merges kept from the reference vocabulary file; the rest are unused by CLIP.
const MAX_MERGES: usize = 49152 - 256 - 2;

fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bs: Vec<u8> = (b'!'..=b'~')
        .chain(0xA1u8..=0xAC)
        .chain(0xAEu8..=0xFF)
        .collect();

    let mut cs: Vec<char> = bs.iter().cloned().map(char::from).collect();

    let mut n = 0;
    for b in 0u8..=255u8 {
        if !bs.contains(&b) {
            bs.push(b);
            cs.push(char::from_u32(256 + n).unwrap_or(char::REPLACEMENT_CHARACTER));
            n += 1;
        }
    }

    bs.into_iter().zip(cs).collect()
}

fn get_pairs(word: &[String]) -> Vec<(String, String)> {
    word.iter()
        .cloned()
        .zip(word.iter().skip(1).cloned())
        .collect()
}

fn whitespace_clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn parse_merges(text: &str) -> Vec<(String, String)> {
    text.lines()
        .skip(1) // version header
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some(first), Some(second)) => Some((first.to_string(), second.to_string())),
                _ => None,
            }
        })
        .take(MAX_MERGES)
        .collect()
}

fn construct_vocab(chars: impl Iterator<Item = char> + Clone, merges: &[(String, String)]) -> Vec<String> {
    let iter = chars.map(String::from);
    let mut vocab: Vec<_> = iter.clone().chain(iter.map(|c| c + "</w>")).collect();

    for merge in merges {
        vocab.push(format!("{}{}", merge.0, merge.1));
    }

    vocab.extend([START_OF_TEXT.to_string(), END_OF_TEXT.to_string()]);

    vocab
}

/// Byte-level BPE tokenizer used by CLIP.
#[derive(Debug, Clone)]
pub struct SimpleTokenizer {
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), u32>,
    pat: Regex,
}

impl SimpleTokenizer {
    /// Loads the merges file (`bpe_simple_vocab_16e6.txt` for CLIP).
    pub fn new<P: AsRef<Path>>(merges_path: P) -> Result<Self> {
        let path = merges_path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_merges(&text)
    }

    pub fn from_merges(text: &str) -> Result<Self> {
        let byte_unicode_values = bytes_to_unicode();

        let byte_encoder: HashMap<_, _> = byte_unicode_values.iter().cloned().collect();
        let byte_decoder = byte_encoder.iter().map(|(k, v)| (*v, *k)).collect();

        let merges = parse_merges(text);
        if merges.is_empty() {
            return Err(Error::Tokenizer("merges file holds no merges".into()));
        }

        let vocab = construct_vocab(byte_unicode_values.into_iter().map(|(_, u)| u), &merges[..]);

        let encoder: HashMap<String, u32> = vocab.iter().cloned().zip(0..).collect();
        let decoder: HashMap<u32, String> = encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        let bpe_ranks = merges.into_iter().zip(0..).collect();

        let pat = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|\p{L}+|\p{N}|[^\s\p{L}\p{N}]+",
        )
        .map_err(|e| Error::Tokenizer(e.to_string()))?;

        Ok(SimpleTokenizer {
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            pat,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }

    pub fn start_token(&self) -> u32 {
        self.encoder[START_OF_TEXT]
    }

    pub fn end_token(&self) -> u32 {
        self.encoder[END_OF_TEXT]
    }

    pub fn bpe(&self, token: &str) -> String {
        if token == START_OF_TEXT || token == END_OF_TEXT {
            return token.to_string();
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if let Some(last) = word.last_mut() {
            *last += "</w>";
        }
        let mut pairs = get_pairs(&word);

        if pairs.is_empty() {
            return format!("{}</w>", token);
        }

        while let Some((first, second)) = pairs
            .iter()
            .filter(|pair| self.bpe_ranks.contains_key(*pair))
            .min_by_key(|&pair| self.bpe_ranks[pair])
            .cloned()
        {
            let mut new_word = Vec::new();
            let mut i = 0;
            while i < word.len() {
                if let Some((j, _)) = word.iter().enumerate().skip(i).find(|(_, w)| **w == first) {
                    new_word.extend(word[i..j].iter().cloned());
                    i = j;
                } else {
                    new_word.extend(word[i..].iter().cloned());
                    break;
                }

                if word[i] == first && i < word.len() - 1 && word[i + 1] == second {
                    new_word.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }

            word = new_word;
            if word.len() == 1 {
                break;
            }
            pairs = get_pairs(&word[..]);
        }

        word.join(" ")
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let cleaned_text = whitespace_clean(text.trim()).to_lowercase();

        let mut bpe_tokens: Vec<u32> = Vec::new();

        for m in self.pat.find_iter(&cleaned_text) {
            let token: String = m.as_str().bytes().map(|b| self.byte_encoder[&b]).collect();
            bpe_tokens.extend(
                self.bpe(&token)
                    .split(' ')
                    .filter_map(|bpe_token| self.encoder.get(bpe_token).copied()),
            );
        }

        bpe_tokens
    }

    pub fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter_map(|t| self.decoder.get(t).map(String::as_str))
            .collect();
        let decoded_bytes: Vec<u8> = text
            .chars()
            .filter_map(|c| self.byte_decoder.get(&c).copied())
            .collect();

        String::from_utf8_lossy(&decoded_bytes[..]).replace("</w>", " ")
    }
}
