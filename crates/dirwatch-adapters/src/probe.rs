//! Website probing: fetch a company's landing page once and look for
//! careers/blog links and a contact address.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dirwatch_core::{ProbeOutcome, UnavailableReason, WebSignals};
use dirwatch_storage::{FetchError, HttpFetcher};
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").expect("email pattern compiles")
});

/// Pattern lists as they appear in `rules/enrichment.yaml`. Every pattern
/// is a case-insensitive regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeRuleSet {
    pub careers_patterns: Vec<String>,
    pub blog_patterns: Vec<String>,
    pub email_denylist: Vec<String>,
    /// Address-shaped asset names such as `logo@2x.png`.
    pub ignored_email_suffixes: Vec<String>,
    pub max_scan_bytes: usize,
}

impl Default for ProbeRuleSet {
    fn default() -> Self {
        Self {
            careers_patterns: strings(&[r"careers?", r"\bjobs?\b", r"join-?us", r"hiring"]),
            blog_patterns: strings(&[r"\bblog", r"\bnews\b"]),
            email_denylist: strings(&[r"no-?reply", r"do-?not-?reply", r"@example\.", r"^test@"]),
            ignored_email_suffixes: strings(&[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"]),
            max_scan_bytes: 2 * 1024 * 1024,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid {kind} pattern {pattern:?}: {source}")]
    InvalidPattern {
        kind: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProbeRules {
    careers: Vec<Regex>,
    blog: Vec<Regex>,
    email_denylist: Vec<Regex>,
    ignored_email_suffixes: Vec<String>,
    max_scan_bytes: usize,
}

impl ProbeRules {
    pub fn compile(set: &ProbeRuleSet) -> Result<Self, RuleError> {
        Ok(Self {
            careers: compile_all("careers", &set.careers_patterns)?,
            blog: compile_all("blog", &set.blog_patterns)?,
            email_denylist: compile_all("email denylist", &set.email_denylist)?,
            ignored_email_suffixes: set
                .ignored_email_suffixes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            max_scan_bytes: set.max_scan_bytes.max(1),
        })
    }

    pub fn max_scan_bytes(&self) -> usize {
        self.max_scan_bytes
    }

    fn is_careers_link(&self, href: &str) -> bool {
        self.careers.iter().any(|re| re.is_match(href))
    }

    fn is_blog_link(&self, href: &str) -> bool {
        self.blog.iter().any(|re| re.is_match(href))
    }

    /// Lowercased address when it is worth keeping.
    fn accept_email(&self, candidate: &str) -> Option<String> {
        let email = candidate.trim().to_ascii_lowercase();
        if !EMAIL.find(&email).is_some_and(|m| m.as_str() == email) {
            return None;
        }
        if self.ignored_email_suffixes.iter().any(|s| email.ends_with(s.as_str())) {
            return None;
        }
        if self.email_denylist.iter().any(|re| re.is_match(&email)) {
            return None;
        }
        Some(email)
    }
}

impl Default for ProbeRules {
    fn default() -> Self {
        Self::compile(&ProbeRuleSet::default()).expect("built-in probe patterns compile")
    }
}

fn compile_all(kind: &'static str, patterns: &[String]) -> Result<Vec<Regex>, RuleError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| RuleError::InvalidPattern {
                    kind,
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

/// Scan one landing page. `mailto:` links win over addresses found in the
/// page text.
pub fn scan_html(html: &str, rules: &ProbeRules) -> WebSignals {
    let document = Html::parse_document(html);
    let mut signals = WebSignals::default();

    if let Ok(anchors) = Selector::parse("a[href]") {
        let hrefs: Vec<&str> = document
            .select(&anchors)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .collect();

        signals.has_careers_page = hrefs.iter().any(|href| rules.is_careers_link(href));
        signals.has_blog = hrefs.iter().any(|href| rules.is_blog_link(href));
        signals.contact_email = hrefs.iter().find_map(|href| {
            let address = strip_mailto(href)?;
            let address = address.split('?').next().unwrap_or_default();
            rules.accept_email(address)
        });
    }

    if signals.contact_email.is_none() {
        let text: String = document.root_element().text().collect::<Vec<_>>().join(" ");
        signals.contact_email = EMAIL
            .find_iter(&text)
            .find_map(|m| rules.accept_email(m.as_str()));
    }

    signals
}

fn strip_mailto(href: &str) -> Option<&str> {
    let prefix = href.get(..7)?;
    prefix.eq_ignore_ascii_case("mailto:").then(|| &href[7..])
}

/// Reads a site and reports what it found. Implementations never fail; an
/// unreachable site is an `Unavailable` outcome.
#[async_trait]
pub trait SiteProber: Send + Sync {
    async fn probe(&self, domain: &str) -> ProbeOutcome;
}

pub struct HttpProber {
    http: Arc<HttpFetcher>,
    rules: Arc<ProbeRules>,
    timeout: Duration,
    scheme: String,
}

impl HttpProber {
    pub fn new(http: Arc<HttpFetcher>, rules: Arc<ProbeRules>, timeout: Duration) -> Self {
        Self {
            http,
            rules,
            timeout,
            scheme: "https".to_string(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Landing page URL for a normalized domain.
    pub fn landing_url(&self, domain: &str) -> Result<String, UnavailableReason> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(UnavailableReason::EmptyDomain);
        }
        let valid = !domain.starts_with(['.', '-', ':'])
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
        if !valid {
            return Err(UnavailableReason::InvalidDomain);
        }
        Ok(format!("{}://{}/", self.scheme, domain))
    }
}

fn unavailable_reason(err: &FetchError) -> UnavailableReason {
    match err {
        FetchError::InvalidUrl(_) => UnavailableReason::InvalidDomain,
        FetchError::HttpStatus { status, .. } => UnavailableReason::HttpStatus(*status),
        FetchError::Request(err) if err.is_timeout() => UnavailableReason::Timeout,
        FetchError::Request(err) if err.is_body() || err.is_decode() => UnavailableReason::Body,
        FetchError::Decode { .. } => UnavailableReason::Body,
        FetchError::Request(_) | FetchError::Closed => UnavailableReason::Network,
    }
}

#[async_trait]
impl SiteProber for HttpProber {
    async fn probe(&self, domain: &str) -> ProbeOutcome {
        let url = match self.landing_url(domain) {
            Ok(url) => url,
            Err(reason) => return ProbeOutcome::Unavailable(reason),
        };
        match self.http.get(&url, Some(self.timeout)).await {
            Ok(response) => {
                let limit = response.body.len().min(self.rules.max_scan_bytes());
                let html = String::from_utf8_lossy(&response.body[..limit]);
                ProbeOutcome::Signals(scan_html(&html, &self.rules))
            }
            Err(err) => {
                let reason = unavailable_reason(&err);
                debug!(domain, %reason, error = %err, "site unavailable");
                ProbeOutcome::Unavailable(reason)
            }
        }
    }
}
