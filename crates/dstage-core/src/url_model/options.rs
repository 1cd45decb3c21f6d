/// Split `base;k=v;k2=v2` into the base and its options.
///
/// Options are only recognised after the last `/`, and only when every
/// `;`-separated piece there has the `key=value` form; otherwise the whole
/// string is the base.
pub fn split_options(s: &str) -> (String, Vec<(String, String)>) {
    let tail_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
    let tail = &s[tail_start..];
    let Some(first_sep) = tail.find(';') else {
        return (s.to_string(), Vec::new());
    };
    let mut options = Vec::new();
    for piece in tail[first_sep + 1..].split(';') {
        match piece.split_once('=') {
            Some((k, v)) if !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                options.push((k.to_string(), v.to_string()));
            }
            _ => return (s.to_string(), Vec::new()),
        }
    }
    (s[..tail_start + first_sep].to_string(), options)
}
