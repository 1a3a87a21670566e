use blake2::Blake2b512;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Digest used for span identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Blake2,
    Md5,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Blake2 => "blake2",
            Self::Md5 => "md5",
        }
    }

    pub fn parse_algorithm(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Some(Self::Sha1),
            "blake2" | "blake2b" => Some(Self::Blake2),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a path to lowercased POSIX form without a leading `./`.
pub fn normalize_span_path(path: &str) -> String {
    let posix = path.replace('\\', "/");
    let trimmed = posix.trim_start_matches("./");
    trimmed.to_lowercase()
}

/// Collapse every run of whitespace to a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic digest over `(path, start, end[, text])`.
///
/// The path is compared in lowercased POSIX form and the optional text with
/// whitespace collapsed, so the same logical span always yields the same hash
/// regardless of platform separators or reformatting.
pub fn span_hash(
    algorithm: HashAlgorithm,
    path: &str,
    start_line: u32,
    end_line: u32,
    text: Option<&str>,
) -> String {
    let mut material = format!("{}:{}:{}", normalize_span_path(path), start_line, end_line);
    if let Some(text) = text {
        material.push(':');
        material.push_str(&collapse_whitespace(text));
    }
    match algorithm {
        HashAlgorithm::Sha1 => format!("{:x}", Sha1::digest(material.as_bytes())),
        HashAlgorithm::Blake2 => format!("{:x}", Blake2b512::digest(material.as_bytes())),
        HashAlgorithm::Md5 => format!("{:x}", Md5::digest(material.as_bytes())),
    }
}
