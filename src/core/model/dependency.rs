/// A declared inter-artifact reference.
///
/// `timestamp` is the minimum acceptable version of the depended-on file.
/// An `overrides` dependency intentionally supersedes a co-named entry from
/// another site and is never chased recursively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub filename: String,
    pub timestamp: u64,
    pub overrides: bool,
}

impl Dependency {
    pub fn new(filename: impl Into<String>, timestamp: u64, overrides: bool) -> Self {
        Self {
            filename: filename.into(),
            timestamp,
            overrides,
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.filename)
    }
}
