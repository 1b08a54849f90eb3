use std::io::{self, Read, Write};

use glob::Pattern;

use protocol::wire::{ReadWire, WriteWire};
use protocol::MAXPATHLEN;

/// One include/exclude pattern.
#[derive(Clone, Debug)]
pub struct Filter {
    pattern: String,
    matcher: Pattern,
    include: bool,
    /// Pattern ended in `/`: it only applies to directories.
    directory: bool,
    /// Pattern contains `/`: it matches the full transfer path instead
    /// of the basename.
    full_path: bool,
}

impl Filter {
    fn matches(&self, name: &str, is_dir: bool) -> bool {
        if self.directory && !is_dir {
            return false;
        }
        let candidate = if self.full_path {
            name
        } else {
            name.rsplit('/').next().unwrap_or(name)
        };
        self.matcher.matches(candidate)
    }

    /// Returns `true` for include (`+ `) patterns.
    #[must_use]
    pub const fn is_include(&self) -> bool {
        self.include
    }

    /// The pattern text without its include/exclude prefix.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Ordered filter chain; the first matching pattern decides.
#[derive(Clone, Debug, Default)]
pub struct FilterList {
    filters: Vec<Filter>,
}

impl FilterList {
    /// Creates an empty chain that excludes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of patterns in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` when no patterns are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Parses and appends one pattern. A `+ ` prefix marks an include,
    /// an optional `- ` prefix marks an exclude, a trailing `/` limits
    /// the pattern to directories.
    pub fn add(&mut self, raw: &str) {
        let (include, rest) = match raw.strip_prefix("+ ") {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix("- ").unwrap_or(raw)),
        };
        let directory = rest.ends_with('/') && rest.len() > 1;
        let body = if directory {
            &rest[..rest.len() - 1]
        } else {
            rest
        };
        if body.is_empty() {
            return;
        }
        let matcher = match Pattern::new(body) {
            Ok(matcher) => matcher,
            Err(err) => {
                tracing::error!(pattern = body, %err, "ignoring malformed filter pattern");
                return;
            }
        };
        self.filters.push(Filter {
            pattern: body.to_string(),
            matcher,
            include,
            directory,
            full_path: body.contains('/'),
        });
    }

    /// Appends every pattern of `other`, after this chain's own.
    pub fn extend(&mut self, other: FilterList) {
        self.filters.extend(other.filters);
    }

    /// Returns `true` when `name` should be skipped. The first pattern
    /// that matches wins; include matches stop the scan without
    /// excluding.
    #[must_use]
    pub fn excludes(&self, name: &str, is_dir: bool) -> bool {
        for filter in &self.filters {
            if filter.matches(name, is_dir) {
                return !filter.include;
            }
        }
        false
    }
}

/// Transmits the filter chain: each pattern as `u32 len + bytes` with
/// includes carrying a `+ ` prefix (protocol ≥ 19), then a zero length.
pub fn send_filter_list<W: Write>(
    f: &mut W,
    filters: &FilterList,
    protocol: i32,
) -> io::Result<()> {
    for filter in &filters.filters {
        let mut pattern = filter.pattern.clone();
        if filter.directory {
            pattern.push('/');
        }
        if filter.include {
            if protocol < 19 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "peer does not support include syntax",
                ));
            }
            f.write_int(pattern.len() as i32 + 2)?;
            f.write_all(b"+ ")?;
        } else {
            f.write_int(pattern.len() as i32)?;
        }
        f.write_all(pattern.as_bytes())?;
    }
    f.write_int(0)
}

/// Receives a filter chain sent by [`send_filter_list`].
pub fn recv_filter_list<R: Read>(f: &mut R) -> io::Result<FilterList> {
    let mut filters = FilterList::new();
    loop {
        let len = f.read_int()?;
        if len == 0 {
            return Ok(filters);
        }
        let len = usize::try_from(len)
            .ok()
            .filter(|&l| l < MAXPATHLEN)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "overflow: filter pattern")
            })?;
        let raw = f.read_vec(len)?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        filters.add(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(patterns: &[&str]) -> FilterList {
        let mut filters = FilterList::new();
        for pattern in patterns {
            filters.add(pattern);
        }
        filters
    }

    #[test]
    fn empty_chain_excludes_nothing() {
        assert!(!FilterList::new().excludes("anything", false));
    }

    #[test]
    fn basename_patterns_match_anywhere() {
        let filters = chain(&["*.o"]);
        assert!(filters.excludes("main.o", false));
        assert!(filters.excludes("deep/build/main.o", false));
        assert!(!filters.excludes("main.c", false));
    }

    #[test]
    fn slash_patterns_match_the_full_path() {
        let filters = chain(&["build/*"]);
        assert!(filters.excludes("build/out.bin", false));
        assert!(!filters.excludes("src/build.rs", false));
    }

    #[test]
    fn directory_patterns_only_match_directories() {
        let filters = chain(&["tmp/"]);
        assert!(filters.excludes("tmp", true));
        assert!(!filters.excludes("tmp", false));
    }

    #[test]
    fn first_match_wins() {
        let filters = chain(&["+ keep.o", "*.o"]);
        assert!(!filters.excludes("keep.o", false));
        assert!(filters.excludes("other.o", false));
    }

    #[test]
    fn wire_round_trip() {
        let filters = chain(&["+ keep.o", "*.o", "cache/"]);
        let mut wire = Vec::new();
        send_filter_list(&mut wire, &filters, 26).expect("send");

        let decoded = recv_filter_list(&mut &wire[..]).expect("recv");
        assert_eq!(decoded.len(), 3);
        assert!(!decoded.excludes("keep.o", false));
        assert!(decoded.excludes("x.o", false));
        assert!(decoded.excludes("cache", true));
        assert!(!decoded.excludes("cache", false));
    }

    #[test]
    fn includes_need_protocol_19() {
        let filters = chain(&["+ keep.o"]);
        let mut wire = Vec::new();
        let err = send_filter_list(&mut wire, &filters, 18).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn empty_list_is_a_single_zero() {
        let mut wire = Vec::new();
        send_filter_list(&mut wire, &FilterList::new(), 26).expect("send");
        assert_eq!(wire, vec![0, 0, 0, 0]);
    }
}
