use http::HeaderMap;

/// Append every value of every header in `src` to `dst`.
///
/// Existing values in `dst` are kept and per-name order is preserved. Nothing
/// is filtered, so hop-by-hop headers travel along too.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name, value.clone());
    }
}
