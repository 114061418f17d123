use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("room code already registered to a different room")]
    CodeTaken,
    #[error("room code not found")]
    NotFound,
}

/// Word lists indexed by the room id hash. Fixed: changing them changes
/// every code in circulation.
const ADJECTIVES: [&str; 16] = [
    "amber", "blue", "cosmic", "dusty", "electric", "golden", "lunar", "misty", "neon", "polar",
    "rusty", "silver", "sonic", "velvet", "wild", "zesty",
];

const NOUNS: [&str; 16] = [
    "bass", "beacon", "bonfire", "canopy", "drum", "ember", "garden", "lantern", "meadow",
    "pavilion", "pulse", "river", "stage", "tent", "torch", "wave",
];

/// FNV-1a 64-bit rolling hash over the normalized room id.
fn rolling_hash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Canonical form used for hashing and comparison: case-folded, spaces and
/// underscores unified to hyphens, runs collapsed, edges trimmed.
fn normalize(room_id: &str) -> String {
    let mut out = String::with_capacity(room_id.len());
    let mut last_dash = true;
    for c in room_id.chars() {
        let c = if c == ' ' || c == '_' { '-' } else { c };
        if c == '-' {
            if !last_dash {
                out.push('-');
                last_dash = true;
            }
        } else {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_dash = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Pure, deterministic mapping from a room id to a human-shareable code of
/// the form `adjective-noun-NN`.
///
/// Tokens of the room id that already appear in the word lists are kept, so
/// a room literally named after list words keeps them in its code; all other
/// picks come from the rolling hash. The mapping is lossy many-to-one over a
/// small code space: `decode(encode(x)) == x` is NOT guaranteed.
pub fn encode(room_id: &str) -> String {
    let norm = normalize(room_id);
    let h = rolling_hash(&norm);
    let tokens: Vec<&str> = norm.split('-').collect();

    let adjective = tokens
        .iter()
        .find(|t| ADJECTIVES.contains(t))
        .copied()
        .unwrap_or(ADJECTIVES[((h >> 16) % ADJECTIVES.len() as u64) as usize]);
    let noun = tokens
        .iter()
        .find(|t| NOUNS.contains(t))
        .copied()
        .unwrap_or(NOUNS[((h >> 32) % NOUNS.len() as u64) as usize]);

    format!("{adjective}-{noun}-{:02}", h % 100)
}

/// Bounded candidate set of plausible original room names for a code:
/// normalization variants of the code's constituent words (separator
/// substitution, concatenation, plural suffix stripping, single words), plus
/// the literal code itself for rooms named after a shared code.
fn candidates(code: &str) -> Vec<String> {
    let mut words: Vec<&str> = code.split('-').collect();
    // Drop the trailing numeric suffix from the word pool.
    if words
        .last()
        .is_some_and(|w| w.chars().all(|c| c.is_ascii_digit()))
    {
        words.pop();
    }

    let mut stripped: Vec<String> = Vec::with_capacity(words.len());
    for w in &words {
        stripped.push(w.strip_suffix('s').unwrap_or(w).to_string());
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |c: String| {
        if !c.is_empty() && seen.insert(c.clone()) {
            out.push(c);
        }
    };

    push(words.join("-"));
    push(words.join(" "));
    push(words.join("_"));
    push(words.concat());
    push(stripped.join("-"));
    push(stripped.concat());
    for w in &words {
        push((*w).to_string());
    }
    for w in &stripped {
        push(w.clone());
    }
    push(code.to_string());
    out
}

/// Registration table mapping codes to canonical room ids. Codes resolve
/// O(1) once registered; unregistered codes fall back to the candidate
/// search. First registrant wins a contested code.
#[derive(Clone, Default)]
pub struct RoomCodeCodec {
    by_code: Arc<RwLock<HashMap<String, String>>>,
}

impl RoomCodeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `(code, room_id)` pair. Idempotent for an identical pair;
    /// a different room id for a taken code fails with `CodeTaken`.
    pub async fn register(&self, code: &str, room_id: &str) -> Result<(), CodecError> {
        let mut table = self.by_code.write().await;
        match table.get(code) {
            Some(existing) if existing == room_id => Ok(()),
            Some(_) => Err(CodecError::CodeTaken),
            None => {
                table.insert(code.to_string(), room_id.to_string());
                tracing::debug!(%code, %room_id, "room code registered");
                Ok(())
            }
        }
    }

    /// Resolve a code to its room id: registered table first, then the
    /// bounded candidate search. A successful search registers the mapping,
    /// making every later resolution O(1) and stable.
    pub async fn resolve(&self, code: &str) -> Result<String, CodecError> {
        if let Some(room_id) = self.by_code.read().await.get(code) {
            return Ok(room_id.clone());
        }

        for candidate in candidates(code) {
            if encode(&candidate) == code {
                let room_id = normalize(&candidate);
                let mut table = self.by_code.write().await;
                // A concurrent resolve may have won the race; keep its answer.
                let resolved = table
                    .entry(code.to_string())
                    .or_insert_with(|| room_id.clone())
                    .clone();
                tracing::debug!(%code, room_id = %resolved, "room code resolved heuristically");
                return Ok(resolved);
            }
        }

        Err(CodecError::NotFound)
    }
}
