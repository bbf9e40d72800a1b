use crate::version::ParsedVersion;

/// Returns the newest candidate sharing `reference`'s prefix and suffix.
///
/// Candidates parsing to the same numeric components keep the first one encountered.
/// No candidate of a matching format is a normal outcome and yields `None`.
pub fn select_latest_matching<S: AsRef<str>>(
    reference: &ParsedVersion,
    candidates: &[S],
) -> Option<String> {
    candidates
        .iter()
        .map(|candidate| ParsedVersion::parse(candidate.as_ref()))
        .filter(|candidate| candidate.matches_format(reference))
        .fold(None::<ParsedVersion>, |best, candidate| match best {
            Some(best) if candidate <= best => Some(best),
            _ => Some(candidate),
        })
        .map(|latest| latest.original().to_string())
}
