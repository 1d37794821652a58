//! Similarity scoring for search results.
//!
//! Pure, stateless functions: URL normalization, character-sequence and
//! word-overlap similarity, keyword extraction, and content fingerprints.
//! Nothing here performs I/O, so comparisons can run on any thread.
//!
//! # Title similarity
//!
//! ```text
//! title_similarity(a, b) = ( sequence_ratio(a, b) + jaccard(words(a), words(b)) ) / 2
//! ```
//!
//! `sequence_ratio` is the Ratcliff/Obershelp ratio `2·M / T`, where `M`
//! is the number of characters in matching blocks and `T` the combined
//! length of both strings.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters dropped by [`normalize_url`], in addition to any
/// parameter starting with [`TRACKING_PREFIX`].
const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "msclkid", "_ga", "ref", "source"];

const TRACKING_PREFIX: &str = "utm_";

/// Sequences at least this long get the "popular element" treatment when
/// searching for matching blocks.
const AUTOJUNK_MIN_LEN: usize = 200;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "his", "how", "its", "may", "new", "now", "who", "did", "does",
    "use", "via", "with", "from", "that", "this", "have", "will", "been", "into", "more", "some",
    "such", "than", "what", "when", "where", "which", "while", "about", "their", "there",
    "these", "those", "would", "could", "should", "also", "over", "after", "before", "between",
    "through", "during", "among", "within", "without", "your", "they", "them", "were", "being",
];

/// Canonicalise a URL for duplicate comparison.
///
/// 1. Trim and lowercase the whole URL (percent escapes included).
/// 2. Strip a leading `www.` from the host.
/// 3. Drop the fragment and tracking parameters (`utm_*`, `gclid`,
///    `fbclid`, `msclkid`, `_ga`, `ref`, `source`); the remaining
///    parameters keep their order and encoding.
/// 4. Collapse an empty path to `/`.
/// 5. Rebuild as `scheme://host[:port]/path[?query]`.
///
/// Inputs that do not parse as a URL with a host come back trimmed and
/// lowercased. The function is idempotent.
///
/// ```
/// use greylit_core::similarity::normalize_url;
///
/// assert_eq!(
///     normalize_url("https://WWW.Example.org/report?utm_source=news&id=7#top"),
///     "https://example.org/report?id=7"
/// );
/// ```
pub fn normalize_url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let Ok(parsed) = Url::parse(&lowered) else {
        return lowered;
    };
    let Some(host) = parsed.host_str() else {
        return lowered;
    };

    let mut host = host;
    while let Some(rest) = host.strip_prefix("www.") {
        if rest.is_empty() {
            break;
        }
        host = rest;
    }

    let mut out = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let path = parsed.path();
    if path.is_empty() {
        out.push('/');
    } else {
        out.push_str(path);
    }

    if let Some(query) = parsed.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !is_tracking_param(pair))
            .collect();
        if !kept.is_empty() {
            out.push('?');
            out.push_str(&kept.join("&"));
        }
    }

    // Serialisation may introduce upper-case percent escapes.
    out.to_lowercase()
}

fn is_tracking_param(pair: &str) -> bool {
    let key = pair.split('=').next().unwrap_or_default();
    key.starts_with(TRACKING_PREFIX) || TRACKING_PARAMS.contains(&key)
}

/// Host of the normalized URL (without `www.`), if the URL has one.
pub fn url_domain(raw: &str) -> Option<String> {
    let normalized = normalize_url(raw);
    Url::parse(&normalized)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Ratcliff/Obershelp similarity of two strings, in `[0, 1]`.
///
/// Two empty strings are identical (`1.0`).
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = SequenceMatcher::new(&a, &b).matching_characters();
    2.0 * matches as f64 / total as f64
}

/// Matching-block search over two character sequences.
struct SequenceMatcher<'a> {
    a: &'a [char],
    b: &'a [char],
    /// Positions of each character in `b`, minus "popular" characters when
    /// `b` is long.
    b2j: HashMap<char, Vec<usize>>,
}

impl<'a> SequenceMatcher<'a> {
    fn new(a: &'a [char], b: &'a [char]) -> Self {
        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, c) in b.iter().enumerate() {
            b2j.entry(*c).or_default().push(j);
        }
        if b.len() >= AUTOJUNK_MIN_LEN {
            let limit = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= limit);
        }
        Self { a, b, b2j }
    }

    /// Longest matching block in `a[alo..ahi]` × `b[blo..bhi]` as
    /// `(i, j, size)`. Ties go to the earliest block in `a`, then in `b`.
    fn find_longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0usize);
        let mut j2len: HashMap<usize, usize> = HashMap::new();

        for i in alo..ahi {
            let mut next_j2len: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j
                        .checked_sub(1)
                        .and_then(|prev| j2len.get(&prev))
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    next_j2len.insert(j, k);
                    if k > best_size {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_size = k;
                    }
                }
            }
            j2len = next_j2len;
        }

        // Popular characters are absent from b2j; grow the block over them.
        while best_i > alo && best_j > blo && self.a[best_i - 1] == self.b[best_j - 1] {
            best_i -= 1;
            best_j -= 1;
            best_size += 1;
        }
        while best_i + best_size < ahi
            && best_j + best_size < bhi
            && self.a[best_i + best_size] == self.b[best_j + best_size]
        {
            best_size += 1;
        }

        (best_i, best_j, best_size)
    }

    /// Total size of all matching blocks.
    fn matching_characters(&self) -> usize {
        let mut total = 0;
        let mut pending = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            let (i, j, k) = self.find_longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            total += k;
            if alo < i && blo < j {
                pending.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                pending.push((i + k, ahi, j + k, bhi));
            }
        }
        total
    }
}

/// Jaccard overlap of two sets; `0.0` when both are empty.
fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two titles in `[0, 1]`: the mean of the character-sequence
/// ratio and the word-level Jaccard overlap, both on lowercased input.
///
/// Returns `0.0` if either title is empty.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    let sequence = sequence_ratio(&a, &b);
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    let words = jaccard(&words_a, &words_b);

    (sequence + words) / 2.0
}

/// Significant words of a title: punctuation stripped, lowercased, tokens of
/// two characters or fewer and common English stop words removed.
pub fn extract_keywords(title: &str) -> HashSet<String> {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();

    cleaned
        .split_whitespace()
        .filter(|word| word.chars().count() > 2 && !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of two keyword sets.
pub fn keyword_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    jaccard(a, b)
}

/// SHA-256 of the lowercased, whitespace-collapsed text.
pub fn content_fingerprint(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(collapsed.as_bytes());
    format!("{:x}", hasher.finalize())
}
