use crate::AUDIO_EXTENSION;

/// Which part of a paired trial a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Part {
    A,
    B,
    Ab,
}

impl Part {
    /// Filename prefix for this part, including the separator.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::A => "A_",
            Self::B => "B_",
            Self::Ab => "AB_",
        }
    }
}

/// True if `name` carries the audio extension (case-insensitive).
pub fn is_audio_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(AUDIO_EXTENSION))
        .unwrap_or(false)
}

/// Strip `prefix` and the audio extension from `filename` to get the pair key.
///
/// Returns `None` when the prefix doesn't match, the extension isn't audio,
/// or nothing is left between them.
///
/// `derive_key("A_c_major.wav", "A_") == Some("c_major")`
pub fn derive_key<'a>(filename: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = filename.strip_prefix(prefix)?;
    let (key, ext) = rest.rsplit_once('.')?;
    if key.is_empty() || !ext.eq_ignore_ascii_case(AUDIO_EXTENSION) {
        return None;
    }
    Some(key)
}

/// Classify a paired-stimulus filename into its part and key.
///
/// Naming is `A_<key>.wav`, `B_<key>.wav`, `AB_<key>.wav`. The prefix is
/// case-sensitive, the extension is not.
pub fn classify(filename: &str) -> Option<(Part, &str)> {
    [Part::Ab, Part::A, Part::B]
        .into_iter()
        .find_map(|part| derive_key(filename, part.prefix()).map(|key| (part, key)))
}
