const SEPARATOR: char = '/';

/// Maps logical keys into a bucket-relative key space.
///
/// Built from a `bucket[/prefix]` path. A non-empty prefix always ends with
/// exactly one separator and never starts with one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    bucket: String,
    prefix: String,
}

impl KeySpace {
    pub fn parse(path: &str) -> Self {
        let (bucket, prefix) = match path.split_once(SEPARATOR) {
            Some((bucket, prefix)) => (bucket, normalize_prefix(prefix)),
            None => (path, String::new()),
        };

        Self {
            bucket: bucket.to_string(),
            prefix,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the physical key for `key`. Keys are never rejected here.
    pub fn map(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches(SEPARATOR);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}{SEPARATOR}")
    }
}
