use std::cmp::Ordering;
use std::fmt;

/// A version string split into `prefix`, numeric components and `suffix`.
///
/// `v1.20.1` is `("v", [1, 20, 1], "")`, `2.399.1-lts-rhel-jdk` is
/// `("", [2, 399, 1], "-lts-rhel-jdk")`. Ordering and equality only look at the numeric
/// components (zero padded to equal length), prefix and suffix decide whether two versions
/// share a format, see [`ParsedVersion::matches_format`].
#[derive(Debug, Clone)]
pub struct ParsedVersion {
    original: String,
    prefix: String,
    components: Vec<u64>,
    suffix: String,
    numeric: bool,
}

impl ParsedVersion {
    /// Never fails. Input without digits keeps everything in `prefix` and gets the single
    /// component `0`, as does a numeric run too large for `u64`.
    pub fn parse(s: &str) -> Self {
        let Some(start) = s.find(|c: char| c.is_ascii_digit()) else {
            return Self::unparseable(s);
        };

        let run_len = s[start..]
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len() - start);
        let end = start + run_len;

        // `1.2.3-beta.4` stops at the dash, `1.2.beta.4` stops at the empty segment left by the
        // trailing dot of the run, so later dotted material never pollutes the components.
        let mut components = Vec::new();
        for segment in s[start..end].split('.') {
            if segment.is_empty() {
                break;
            }
            match segment.parse::<u64>() {
                Ok(component) => components.push(component),
                // all digits, so the segment overflows
                Err(_) => return Self::unparseable(s),
            }
        }

        Self {
            original: s.to_string(),
            prefix: s[..start].to_string(),
            components,
            suffix: s[end..].to_string(),
            numeric: true,
        }
    }

    fn unparseable(s: &str) -> Self {
        Self {
            original: s.to_string(),
            prefix: s.to_string(),
            components: vec![0],
            suffix: String::new(),
            numeric: false,
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Component at `index`, `0` when the version is shorter.
    pub fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }

    pub fn major(&self) -> u64 {
        self.component(0)
    }

    /// True when the input had no digits at all.
    pub fn is_unparseable(&self) -> bool {
        !self.numeric
    }

    /// Same prefix and same suffix, compared as exact strings.
    pub fn matches_format(&self, other: &ParsedVersion) -> bool {
        self.prefix == other.prefix && self.suffix == other.suffix
    }

    /// Index of the first component that differs after zero padding.
    pub fn first_difference(&self, other: &ParsedVersion) -> Option<usize> {
        let len = self.components.len().max(other.components.len());
        (0..len).find(|&i| self.component(i) != other.component(i))
    }
}

impl PartialEq for ParsedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ParsedVersion {}

impl PartialOrd for ParsedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.first_difference(other) {
            Some(i) => self.component(i).cmp(&other.component(i)),
            None => Ordering::Equal,
        }
    }
}

impl fmt::Display for ParsedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}
