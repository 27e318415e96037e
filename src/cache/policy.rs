//! Resource classification: which policy a request is served under.

use url::Url;

use super::traits::CachePolicy;

/// File extensions treated as static assets.
pub const DEFAULT_STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "json", "png", "jpg", "jpeg", "gif", "svg", "webp", "woff", "woff2", "ttf", "eot",
];

/// Broad class of a requested resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// `/api/` paths and anything on a foreign host
  Api,
  /// Files with a static asset extension
  StaticAsset,
  /// Everything else (pages, documents)
  Document,
}

impl ResourceClass {
  pub fn policy(self) -> CachePolicy {
    match self {
      Self::Api => CachePolicy::NetworkFirst,
      Self::StaticAsset => CachePolicy::CacheFirst,
      Self::Document => CachePolicy::StaleWhileRevalidate,
    }
  }
}

/// Classifies request URLs relative to the application's origin.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  static_extensions: Vec<String>,
}

impl Classifier {
  pub fn new(origin: Url, static_extensions: &[String]) -> Self {
    Self {
      origin,
      static_extensions: static_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
    }
  }

  pub fn with_default_extensions(origin: Url) -> Self {
    let defaults: Vec<String> = DEFAULT_STATIC_EXTENSIONS.iter().map(|s| s.to_string()).collect();
    Self::new(origin, &defaults)
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Classify `url`. Non-HTTP(S) URLs are not intercepted and yield `None`.
  pub fn classify(&self, url: &Url) -> Option<ResourceClass> {
    if !matches!(url.scheme(), "http" | "https") {
      return None;
    }

    if url.path().starts_with("/api/") || url.host_str() != self.origin.host_str() {
      return Some(ResourceClass::Api);
    }

    if self.is_static(url.path()) {
      return Some(ResourceClass::StaticAsset);
    }

    Some(ResourceClass::Document)
  }

  fn is_static(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_ascii_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::with_default_extensions(Url::parse("https://reader.test/").unwrap())
  }

  fn classify(url: &str) -> Option<ResourceClass> {
    classifier().classify(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_api_paths_are_network_first() {
    assert_eq!(classify("https://reader.test/api/v1/books"), Some(ResourceClass::Api));
    assert_eq!(ResourceClass::Api.policy(), CachePolicy::NetworkFirst);
  }

  #[test]
  fn test_foreign_hosts_are_api() {
    assert_eq!(classify("https://cdn.other.test/lib.js"), Some(ResourceClass::Api));
  }

  #[test]
  fn test_static_assets_are_cache_first() {
    assert_eq!(classify("https://reader.test/styles.css"), Some(ResourceClass::StaticAsset));
    assert_eq!(
      classify("https://reader.test/assets/icons/Moon.SVG"),
      Some(ResourceClass::StaticAsset)
    );
    assert_eq!(ResourceClass::StaticAsset.policy(), CachePolicy::CacheFirst);
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    assert_eq!(classify("https://reader.test/"), Some(ResourceClass::Document));
    assert_eq!(classify("https://reader.test/index.html"), Some(ResourceClass::Document));
    assert_eq!(classify("https://reader.test/v1.2/reader"), Some(ResourceClass::Document));
    assert_eq!(ResourceClass::Document.policy(), CachePolicy::StaleWhileRevalidate);
  }

  #[test]
  fn test_non_http_is_not_intercepted() {
    assert_eq!(classify("chrome-extension://abc/script.js"), None);
    assert_eq!(classify("data:text/plain,hello"), None);
  }

  #[test]
  fn test_custom_extensions_accept_leading_dots() {
    let classifier = Classifier::new(
      Url::parse("https://reader.test/").unwrap(),
      &[".EPUB".to_string()],
    );
    let url = Url::parse("https://reader.test/books/a.epub").unwrap();
    assert_eq!(classifier.classify(&url), Some(ResourceClass::StaticAsset));
    let css = Url::parse("https://reader.test/styles.css").unwrap();
    assert_eq!(classifier.classify(&css), Some(ResourceClass::Document));
  }
}
