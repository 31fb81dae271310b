/// Ordered, case-insensitive header list used between the router and the
/// preparers. Names keep their original casing for the upstream request.
pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
        Some((_, existing)) => *existing = value,
        None => headers.push((name, value)),
    }
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let idx = headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Authorization".to_string(), "Bearer a".to_string())];
        header_set(&mut headers, "authorization", "Bearer b");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "AUTHORIZATION"), Some("Bearer b"));
    }

    #[test]
    fn remove_returns_the_old_value() {
        let mut headers: Headers = vec![("X-Api-Key".to_string(), "k".to_string())];
        assert_eq!(header_remove(&mut headers, "x-api-key").as_deref(), Some("k"));
        assert!(headers.is_empty());
        assert!(header_remove(&mut headers, "x-api-key").is_none());
    }
}
