//! Regular header fields of an HTTP/2 message
//!
//! HTTP/2 sends field names in lowercase, so names are normalized on insert
//! and lookups only lowercase the query. Pseudo-header fields (`:method`,
//! `:status`, ...) are kept out of this list by the message types.

/// Ordered header field list
///
/// Repeated names are kept as separate entries in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; the name is stored lowercase
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.fields.push((name, value.into()));
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values(name).next()
    }

    /// Every value of `name`, in wire order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.values(name).collect()
    }

    /// Whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_ascii_lowercase();
        self.fields
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields as (name, value), in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> Extend<(N, V)> for Headers {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_lowercased() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");

        assert_eq!(headers.iter().next(), Some(("content-type", "text/html")));
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.contains("Content-Type"));
        assert!(!headers.contains("content-length"));
    }

    #[test]
    fn test_repeated_fields_keep_order() {
        let headers: Headers = [("cookie", "a=1"), ("accept", "*/*"), ("cookie", "b=2")]
            .into_iter()
            .collect();

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("cookie"), Some("a=1"));
        assert_eq!(headers.get_all("cookie"), vec!["a=1", "b=2"]);
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["cookie", "accept", "cookie"]);
    }

    #[test]
    fn test_empty() {
        let headers = Headers::new();
        assert!(headers.is_empty());
        assert_eq!(headers.get("anything"), None);
        assert!(headers.get_all("anything").is_empty());
    }
}
