//! Workload identifiers (`spiffe://<trust-domain>/<segment>/...`) and trust domains.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SCHEME_PREFIX: &str = "spiffe://";

/// A validated SPIFFE trust domain name, e.g. `example.org`.
///
/// Trust domains key every bundle lookup. Comparison is exact on the
/// canonical (lowercase) name.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrustDomain(String);

/// A workload identifier: a trust domain plus an ordered list of path segments.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    segments: Vec<String>,
}

/// Why a string could not be parsed as a [`SpiffeId`] or [`TrustDomain`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum SpiffeIdError {
    /// Empty input.
    #[error("cannot be empty")]
    Empty,

    /// The input does not start with `spiffe://`.
    #[error("scheme is missing or invalid")]
    WrongScheme,

    /// Nothing between the scheme and the first `/`.
    #[error("trust domain is missing")]
    MissingTrustDomain,

    /// Trust domains only allow `[a-z0-9._-]`.
    #[error(
        "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and \
         underscores"
    )]
    BadTrustDomainChar,

    /// Path segments only allow `[a-zA-Z0-9._-]`.
    #[error(
        "path segment characters are limited to letters, numbers, dots, dashes, and underscores"
    )]
    BadPathSegmentChar,

    /// `//` inside the path.
    #[error("path cannot contain empty segments")]
    EmptySegment,

    /// A `.` or `..` segment.
    #[error("path cannot contain dot segments")]
    DotSegment,

    /// The path ends with `/`.
    #[error("path cannot have a trailing slash")]
    TrailingSlash,
}

fn is_trust_domain_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-')
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn check_segment(segment: &str) -> Result<(), SpiffeIdError> {
    match segment {
        "" => Err(SpiffeIdError::EmptySegment),
        "." | ".." => Err(SpiffeIdError::DotSegment),
        s if s.chars().all(is_segment_char) => Ok(()),
        _ => Err(SpiffeIdError::BadPathSegmentChar),
    }
}

impl TrustDomain {
    /// Parses a trust domain from a bare name (`example.org`) or from a full
    /// SPIFFE ID (`spiffe://example.org/workload`), keeping only the domain.
    ///
    /// # Errors
    ///
    /// Returns a [`SpiffeIdError`] if the name contains characters outside
    /// `[a-z0-9._-]` or the SPIFFE ID is malformed.
    ///
    /// # Examples
    ///
    /// ```
    /// use spiffe_source::TrustDomain;
    ///
    /// let td = TrustDomain::new("spiffe://example.org/workload").unwrap();
    /// assert_eq!("example.org", td.as_str());
    /// assert_eq!("spiffe://example.org", td.id_string());
    /// ```
    pub fn new(name_or_id: &str) -> Result<Self, SpiffeIdError> {
        if name_or_id.is_empty() {
            return Err(SpiffeIdError::MissingTrustDomain);
        }
        if name_or_id.contains(":/") {
            return SpiffeId::new(name_or_id).map(|id| id.trust_domain);
        }
        if !name_or_id.chars().all(is_trust_domain_char) {
            return Err(SpiffeIdError::BadTrustDomainChar);
        }
        Ok(Self(name_or_id.to_owned()))
    }

    /// The canonical trust domain name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trust domain as a SPIFFE ID string, e.g. `spiffe://example.org`.
    pub fn id_string(&self) -> String {
        format!("{SCHEME_PREFIX}{}", self.0)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrustDomain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TrustDomain {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for TrustDomain {
    type Error = SpiffeIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl SpiffeId {
    /// Parses `spiffe://<trust-domain>[/<segment>...]`.
    ///
    /// # Errors
    ///
    /// Returns a [`SpiffeIdError`] naming the first rule the input breaks.
    ///
    /// # Examples
    ///
    /// ```
    /// use spiffe_source::SpiffeId;
    ///
    /// let id = SpiffeId::new("spiffe://example.org/ns/prod/sa/api").unwrap();
    /// assert_eq!("example.org", id.trust_domain().as_str());
    /// assert_eq!(vec!["ns", "prod", "sa", "api"], id.segments().collect::<Vec<_>>());
    /// ```
    pub fn new(id: &str) -> Result<Self, SpiffeIdError> {
        if id.is_empty() {
            return Err(SpiffeIdError::Empty);
        }
        let rest = id
            .strip_prefix(SCHEME_PREFIX)
            .ok_or(SpiffeIdError::WrongScheme)?;

        let (domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        if domain.is_empty() {
            return Err(SpiffeIdError::MissingTrustDomain);
        }
        if !domain.chars().all(is_trust_domain_char) {
            return Err(SpiffeIdError::BadTrustDomainChar);
        }

        let segments = match path.strip_prefix('/') {
            None => Vec::new(),
            Some(path) => Self::parse_path(path)?,
        };

        Ok(Self {
            trust_domain: TrustDomain(domain.to_owned()),
            segments,
        })
    }

    fn parse_path(path: &str) -> Result<Vec<String>, SpiffeIdError> {
        let parts: Vec<&str> = path.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.into_iter().enumerate() {
            if part.is_empty() && idx == last {
                return Err(SpiffeIdError::TrailingSlash);
            }
            check_segment(part)?;
            segments.push(part.to_owned());
        }
        Ok(segments)
    }

    /// Builds an identifier from a trust domain and individual path segments.
    ///
    /// # Errors
    ///
    /// Returns a [`SpiffeIdError`] if a segment is empty, a dot segment, or
    /// contains a character outside `[a-zA-Z0-9._-]` (including `/`).
    pub fn from_segments<S: AsRef<str>>(
        trust_domain: TrustDomain,
        segments: &[S],
    ) -> Result<Self, SpiffeIdError> {
        let segments = segments
            .iter()
            .map(|s| check_segment(s.as_ref()).map(|()| s.as_ref().to_owned()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            trust_domain,
            segments,
        })
    }

    /// The trust domain that issued this identity.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    /// The path with its leading `/`, or `""` for a trust domain ID.
    pub fn path(&self) -> String {
        self.segments.iter().fold(String::new(), |mut acc, s| {
            acc.push('/');
            acc.push_str(s);
            acc
        })
    }

    /// Whether this identity belongs to `trust_domain`.
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        self.trust_domain == *trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}", self.trust_domain)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for SpiffeId {
    type Error = SpiffeIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = SpiffeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}
