//! Session strings: memorable `adjective-noun-noun` names
//!
//! Strings are the only thing a joiner needs to know. They are drawn with
//! the system CSPRNG; uniqueness is the registry's job (it retries on
//! collision).

use ring::rand::{SecureRandom, SystemRandom};

/// Longest accepted session string
pub const MAX_SESSION_STRING_LEN: usize = 47;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "bold", "brave", "bright", "calm", "clever", "cold", "cosmic",
    "crimson", "crisp", "daring", "dawn", "deep", "distant", "dusty", "eager", "early", "electric",
    "emerald", "fancy", "fierce", "gentle", "gilded", "glad", "golden", "grand", "green", "happy",
    "hidden", "hollow", "humble", "icy", "jolly", "keen", "lively", "lone", "lucky", "lunar",
    "mellow", "misty", "noble", "polar", "proud", "quick", "quiet", "rapid", "rustic", "scarlet",
    "serene", "silent", "silver", "solar", "steady", "stormy", "sunny", "swift", "tidy", "velvet",
    "vivid", "wandering", "wild", "witty",
];

const NOUNS: &[&str] = &[
    "anchor", "arrow", "aurora", "badger", "basin", "beacon", "birch", "bison", "blossom", "breeze",
    "brook", "canyon", "cedar", "cliff", "cloud", "comet", "coral", "crane", "creek", "dawn",
    "delta", "desert", "dune", "eagle", "ember", "falcon", "fern", "field", "fjord", "flame",
    "forest", "fox", "galaxy", "garden", "glacier", "grove", "harbor", "hawk", "heron", "hill",
    "island", "lagoon", "lake", "lantern", "leaf", "lynx", "maple", "meadow", "mesa", "meteor",
    "mist", "moon", "moss", "mountain", "nebula", "oak", "ocean", "orchid", "otter", "owl",
    "panda", "peak", "pebble", "pine", "planet", "pond", "prairie", "quartz", "rain", "raven",
    "reef", "ridge", "river", "robin", "sage", "shore", "sky", "sparrow", "spring", "star",
    "stone", "storm", "summit", "sun", "thicket", "thunder", "tide", "tiger", "trail", "tree",
    "tundra", "valley", "wave", "willow", "wind", "wolf",
];

/// Pick a random `adjective-noun-noun`
pub fn generate(rng: &SystemRandom) -> Option<String> {
    let adjective = pick(rng, ADJECTIVES)?;
    let first = pick(rng, NOUNS)?;
    let second = pick(rng, NOUNS)?;
    Some(format!("{}-{}-{}", adjective, first, second))
}

fn pick(rng: &SystemRandom, words: &[&'static str]) -> Option<&'static str> {
    let mut buf = [0u8; 4];
    rng.fill(&mut buf).ok()?;
    // Modulo bias is negligible for lists this short
    let i = u32::from_be_bytes(buf) as usize % words.len();
    words.get(i).copied()
}

/// Lowercase letters in exactly three hyphen-separated words
pub fn is_valid(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_SESSION_STRING_LEN {
        return false;
    }
    if !s.bytes().all(|b| b.is_ascii_lowercase() || b == b'-') {
        return false;
    }
    let parts: Vec<&str> = s.split('-').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}
