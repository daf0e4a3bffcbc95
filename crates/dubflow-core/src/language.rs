//! Target language tags.
//!
//! Persisted state and worker requests only ever hold short canonical tags
//! (`en`, `ko`, ...). Natural-language names arriving at the HTTP boundary
//! are canonicalized here and never leak further in.

/// Reserved language tag for task-global stages (speaker diarization).
pub const DEFAULT_LANG: &str = "default";

/// Tags with known worker support.
pub const KNOWN_TAGS: [&str; 7] = ["en", "ko", "ja", "fr", "de", "es", "id"];

/// Canonicalize a client-supplied language into a tag.
///
/// Accepts tags verbatim (lowercased) and the natural-language names the
/// legacy UI sends. Arbitrary other tags pass through; they may simply have
/// no worker support.
pub fn canonicalize(input: &str) -> String {
    let trimmed = input.trim();
    match trimmed {
        "英语" | "English" => "en".to_string(),
        "韩语" | "Korean" => "ko".to_string(),
        "日语" | "Japanese" => "ja".to_string(),
        "法语" | "French" => "fr".to_string(),
        "德语" | "German" => "de".to_string(),
        "西班牙语" | "Spanish" => "es".to_string(),
        "印尼语" | "Indonesian" => "id".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Whether a tag has known worker support.
pub fn is_known_tag(tag: &str) -> bool {
    KNOWN_TAGS.contains(&tag)
}
