use super::PatchError;

/// Escapes a single key for use as a JSON pointer segment.
///
/// # Examples
/// * `"a/b"` becomes `"a~1b"`
/// * `"m~n"` becomes `"m~0n"`
pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Reverses [`escape`].
pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Appends an escaped key to an existing pointer.
pub fn join(prefix: &str, key: &str) -> String {
    format!("{prefix}/{}", escape(key))
}

/// Builds a pointer from unescaped segments.
pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .fold(String::new(), |pointer, segment| join(&pointer, segment.as_ref()))
}

/// Splits a JSON pointer into its unescaped segments.
///
/// # Errors
/// * `PatchError::InvalidPath` - If the pointer is empty or does not start with '/'
pub fn split(path: &str) -> Result<Vec<String>, PatchError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::InvalidPath {
            path: path.to_string(),
            reason: "pointer must start with '/'".to_string(),
        });
    };

    Ok(rest.split('/').map(unescape).collect())
}

/// Returns the first segment of a pointer, the key the store is addressed by.
///
/// # Errors
/// * `PatchError::InvalidPath` - If the pointer is malformed
pub fn top_level_key(path: &str) -> Result<String, PatchError> {
    let segments = split(path)?;

    segments
        .into_iter()
        .next()
        .ok_or_else(|| PatchError::InvalidPath {
            path: path.to_string(),
            reason: "pointer has no segments".to_string(),
        })
}
